//! Path decoding and resume reconciliation
//!
//! An existing artifact path is decoded segment by segment:
//!
//! ```text
//! .../experiment_<n>/<model_type>/<dataset>/<folder_name>/...
//! ```
//!
//! The folder name is parsed with the [`FolderName`] grammar, so decoding is the
//! exact inverse of encoding for every field the folder name captures.

use std::fmt::Display;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::folder::FolderName;
use crate::config::ExperimentConfig;
use crate::{Error, Result};

/// Segment prefix marking the high-level experiment directory.
pub const EXPERIMENT_MARKER: &str = "experiment_";

/// Placeholder used in conflict errors when the path carries no value.
const ABSENT: &str = "<absent>";

/// The configuration fields captured by an experiment path, each optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathFragment {
    /// High-level experiment number.
    pub experiment_number: Option<u32>,
    /// Model architecture.
    pub model_type: Option<String>,
    /// Dataset.
    pub dataset: Option<String>,
    /// Quantization modulus.
    pub quantization: Option<u32>,
    /// Pruning strategy.
    pub prune_method: Option<String>,
    /// Pruning compression ratio.
    pub prune_compression: Option<u32>,
    /// Finetuning epochs.
    pub finetune_epochs: Option<u32>,
}

impl From<&ExperimentConfig> for PathFragment {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            experiment_number: Some(config.experiment_number),
            model_type: Some(config.model_type.clone()),
            dataset: Some(config.dataset.clone()),
            quantization: config.quantization,
            prune_method: config.prune_method.clone(),
            prune_compression: config.prune_compression,
            finetune_epochs: config.finetune_epochs,
        }
    }
}

impl PathFragment {
    /// Copy the captured fields into `config`, leaving the rest untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if an identity field is still unset.
    pub fn apply_to(self, config: &mut ExperimentConfig) -> Result<()> {
        config.experiment_number = self
            .experiment_number
            .ok_or_else(|| Error::configuration("experiment_number", "could not be inferred"))?;
        config.model_type = self
            .model_type
            .ok_or_else(|| Error::configuration("model_type", "could not be inferred"))?;
        config.dataset = self
            .dataset
            .ok_or_else(|| Error::configuration("dataset", "could not be inferred"))?;
        config.quantization = self.quantization;
        config.prune_method = self.prune_method;
        config.prune_compression = self.prune_compression;
        config.finetune_epochs = self.finetune_epochs;
        Ok(())
    }
}

/// Result of decoding a path against the fields a caller already knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inference {
    /// Supplied fields, with the unset ones filled from the path.
    pub fragment: PathFragment,
    /// The path's folder name already carries a pruning branch.
    pub already_pruned: bool,
    /// The path's folder name already carries a quantization branch.
    pub already_quantized: bool,
}

/// Decode the fields captured by `model_path`.
///
/// # Errors
///
/// Returns [`Error::Configuration`] on `model_path` if the path is not inside an
/// experiment directory or its folder name does not parse.
pub fn decode(model_path: &Path) -> Result<(PathFragment, Option<FolderName>)> {
    let text = model_path.to_string_lossy();
    let segments = split_segments(&text);

    let (index, experiment_number) = segments
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, segment)| {
            let digits = segment.strip_prefix(EXPERIMENT_MARKER)?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some((i, digits.parse::<u32>().ok()?))
        })
        .ok_or_else(|| {
            Error::configuration(
                "model_path",
                format!("`{text}` is not inside an `{EXPERIMENT_MARKER}<n>` directory"),
            )
        })?;

    let model_type = segments
        .get(index + 1)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::configuration("model_path", format!("`{text}` has no model type segment"))
        })?;
    let dataset = segments.get(index + 2).filter(|s| !s.is_empty());
    let folder = segments
        .get(index + 3)
        .filter(|s| !s.is_empty())
        .map(|name| FolderName::parse(name, model_type))
        .transpose()?;

    let fragment = PathFragment {
        experiment_number: Some(experiment_number),
        model_type: Some((*model_type).to_string()),
        dataset: dataset.map(|s| (*s).to_string()),
        quantization: folder.as_ref().and_then(FolderName::quantization),
        prune_method: folder
            .as_ref()
            .and_then(FolderName::prune_method)
            .map(str::to_string),
        prune_compression: folder.as_ref().and_then(FolderName::prune_compression),
        finetune_epochs: folder.as_ref().and_then(FolderName::finetune_epochs),
    };
    Ok((fragment, folder))
}

/// Decode `model_path` and reconcile it with the fields the caller supplied.
///
/// Identity fields (`experiment_number`, `model_type`, `dataset`) must match the
/// path whenever both are present. For the compression fields the policy depends
/// on whether the folder name is frozen, i.e. already carries a compression branch:
///
/// | supplied | decoded   | not frozen     | frozen   |
/// |----------|-----------|----------------|----------|
/// | unset    | any       | decoded        | decoded  |
/// | equal    | equal     | accepted       | accepted |
/// | set      | absent    | supplied wins  | conflict |
/// | set      | different | supplied wins  | conflict |
///
/// # Errors
///
/// Returns [`Error::ResumeConflict`] naming the field, both values and the path.
pub fn infer_from_path(model_path: &Path, known: &PathFragment) -> Result<Inference> {
    let (decoded, folder) = decode(model_path)?;
    let frozen = folder.as_ref().is_some_and(FolderName::is_frozen);

    let fragment = PathFragment {
        experiment_number: reconcile(
            "experiment_number",
            known.experiment_number,
            decoded.experiment_number,
            Strictness::Identity,
            model_path,
        )?,
        model_type: reconcile(
            "model_type",
            known.model_type.clone(),
            decoded.model_type,
            Strictness::Identity,
            model_path,
        )?,
        dataset: reconcile(
            "dataset",
            known.dataset.clone(),
            decoded.dataset,
            Strictness::Identity,
            model_path,
        )?,
        quantization: reconcile(
            "quantization",
            known.quantization,
            decoded.quantization,
            Strictness::frozen(frozen),
            model_path,
        )?,
        prune_method: reconcile(
            "prune_method",
            known.prune_method.clone(),
            decoded.prune_method,
            Strictness::frozen(frozen),
            model_path,
        )?,
        prune_compression: reconcile(
            "prune_compression",
            known.prune_compression,
            decoded.prune_compression,
            Strictness::frozen(frozen),
            model_path,
        )?,
        finetune_epochs: reconcile(
            "finetune_epochs",
            known.finetune_epochs,
            decoded.finetune_epochs,
            Strictness::frozen(frozen),
            model_path,
        )?,
    };

    Ok(Inference {
        fragment,
        already_pruned: folder.as_ref().and_then(FolderName::prune_method).is_some(),
        already_quantized: folder.as_ref().and_then(FolderName::quantization).is_some(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strictness {
    /// Mismatch is fatal, absence is tolerated.
    Identity,
    /// Absence and mismatch both tolerated; the supplied value wins.
    Open,
    /// Absence and mismatch both fatal.
    Frozen,
}

impl Strictness {
    const fn frozen(frozen: bool) -> Self {
        if frozen {
            Self::Frozen
        } else {
            Self::Open
        }
    }
}

fn reconcile<T>(
    field: &str,
    supplied: Option<T>,
    found: Option<T>,
    strictness: Strictness,
    path: &Path,
) -> Result<Option<T>>
where
    T: PartialEq + Display,
{
    let conflict = |supplied: &T, found: Option<&T>| Error::ResumeConflict {
        field: field.to_string(),
        supplied: supplied.to_string(),
        found: found.map_or_else(|| ABSENT.to_string(), ToString::to_string),
        path: path.to_path_buf(),
    };

    match (supplied, found) {
        (None, found) => Ok(found),
        (Some(s), Some(f)) if s == f => Ok(Some(s)),
        (Some(s), Some(f)) => match strictness {
            Strictness::Open => Ok(Some(s)),
            Strictness::Identity | Strictness::Frozen => Err(conflict(&s, Some(&f))),
        },
        (Some(s), None) => match strictness {
            Strictness::Identity | Strictness::Open => Ok(Some(s)),
            Strictness::Frozen => Err(conflict(&s, None)),
        },
    }
}

/// Split on whichever path separator the string actually uses.
fn split_segments(text: &str) -> Vec<&str> {
    let forward = text.contains('/');
    let backward = text.contains('\\');
    match (forward, backward) {
        (true, true) => text.split(['/', '\\']).collect(),
        (false, true) => text.split('\\').collect(),
        _ => text.split('/').collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_split_segments_detects_separator() {
        assert_eq!(split_segments("a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(split_segments(r"C:\a\b"), vec!["C:", "a", "b"]);
        assert_eq!(split_segments(r"C:\a/b"), vec!["C:", "a", "b"]);
    }

    #[test]
    fn test_decode_windows_path() {
        let path = PathBuf::from(
            r"D:\runs\experiments\experiment_3\ResNet20\CIFAR10\resnet20_8_quantization\model.pt",
        );
        let (fragment, folder) = decode(&path).unwrap();
        assert_eq!(fragment.experiment_number, Some(3));
        assert_eq!(fragment.model_type.as_deref(), Some("ResNet20"));
        assert_eq!(fragment.dataset.as_deref(), Some("CIFAR10"));
        assert_eq!(fragment.quantization, Some(8));
        assert!(folder.unwrap().is_frozen());
    }

    #[test]
    fn test_decode_ignores_log_file_marker() {
        let path = PathBuf::from("experiments/experiment_2/VGG/CIFAR10/vgg/experiment_2_logs.csv");
        let (fragment, _) = decode(&path).unwrap();
        assert_eq!(fragment.experiment_number, Some(2));
    }

    #[test]
    fn test_decode_requires_marker() {
        let err = decode(Path::new("/models/vgg/best.pt")).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("model_path"));
    }

    #[test]
    fn test_open_field_supplied_wins() {
        let path = Path::new("experiments/experiment_0/VGG/CIFAR10/vgg/checkpoints/best.pt");
        let known = PathFragment {
            prune_method: Some("L1".to_string()),
            prune_compression: Some(4),
            finetune_epochs: Some(5),
            ..PathFragment::default()
        };
        let inference = infer_from_path(path, &known).unwrap();
        assert_eq!(inference.fragment.prune_method.as_deref(), Some("L1"));
        assert_eq!(inference.fragment.experiment_number, Some(0));
        assert!(!inference.already_pruned);
    }

    #[test]
    fn test_identity_mismatch_is_fatal() {
        let path = Path::new("experiments/experiment_0/VGG/CIFAR10/vgg/best.pt");
        let known = PathFragment {
            dataset: Some("MNIST".to_string()),
            ..PathFragment::default()
        };
        let err = infer_from_path(path, &known).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("dataset"));
        assert!(message.contains("MNIST"));
        assert!(message.contains("CIFAR10"));
    }

    #[test]
    fn test_frozen_absence_is_fatal() {
        let path = Path::new(
            "experiments/experiment_0/VGG/CIFAR10/vgg_L1_4_compression_5_finetune_iterations/best.pt",
        );
        let known = PathFragment {
            quantization: Some(8),
            ..PathFragment::default()
        };
        let err = infer_from_path(path, &known).unwrap_err();
        assert!(err.to_string().contains(ABSENT));
        assert!(err.to_string().contains("quantization"));
    }
}
