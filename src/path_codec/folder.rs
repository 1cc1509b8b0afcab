//! Model folder name grammar
//!
//! ```text
//! folder      := stem [branch] [finetune]
//! stem        := lowercase(model_type)
//! branch      := "_" INT "_quantization"
//!              | "_" METHOD "_" INT "_compression"
//! finetune    := "_" INT "_finetune_iterations"
//! ```
//!
//! Parsing runs from the end of the name, so `METHOD` may itself contain `_`.

use std::fmt;

use crate::config::ExperimentConfig;
use crate::{Error, Result};

/// Token separator inside a folder name.
pub const TOKEN_SEPARATOR: char = '_';
/// Marker following the quantization modulus.
pub const QUANTIZATION_MARKER: &str = "quantization";
/// Marker following the pruning compression ratio.
pub const COMPRESSION_MARKER: &str = "compression";
/// Marker following the finetuning epoch count.
pub const FINETUNE_MARKER: &str = "finetune_iterations";

/// The transformation a folder name commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionBranch {
    /// Quantized with the given modulus.
    Quantization {
        /// Quantization modulus.
        modulus: u32,
    },
    /// Pruned with `method` to the given compression ratio.
    Pruning {
        /// Pruning strategy.
        method: String,
        /// Compression ratio.
        compression: u32,
    },
}

/// Parsed form of a model folder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderName {
    stem: String,
    branch: Option<CompressionBranch>,
    finetune_epochs: Option<u32>,
}

impl FolderName {
    /// Derive the folder name for `config`.
    ///
    /// Quantization takes precedence over pruning when both are set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if pruning is requested without a compression
    /// greater than 1 or without a finetuning epoch count.
    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        let branch = match (config.quantization, config.prune_method.as_ref()) {
            (Some(modulus), prune) => {
                if let Some(method) = prune {
                    tracing::warn!(
                        quantization = modulus,
                        prune_method = %method,
                        "Both quantization and pruning requested; folder name encodes quantization only"
                    );
                }
                Some(CompressionBranch::Quantization { modulus })
            }
            (None, Some(method)) => {
                let compression = match config.prune_compression {
                    Some(c) if c > 1 => c,
                    Some(c) => {
                        return Err(Error::configuration(
                            "prune_compression",
                            format!("compression must be greater than 1 when pruning, got {c}"),
                        ))
                    }
                    None => {
                        return Err(Error::configuration(
                            "prune_compression",
                            format!("compression must be provided when pruning with `{method}`"),
                        ))
                    }
                };
                if config.finetune_epochs.is_none() {
                    return Err(Error::configuration(
                        "finetune_epochs",
                        "number of finetuning epochs must be provided when pruning",
                    ));
                }
                Some(CompressionBranch::Pruning {
                    method: method.clone(),
                    compression,
                })
            }
            (None, None) => None,
        };

        Ok(Self {
            stem: config.model_type.to_lowercase(),
            branch,
            finetune_epochs: config.finetune_epochs,
        })
    }

    /// Parse a folder name written for `model_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on `model_path` if `name` does not follow the grammar.
    pub fn parse(name: &str, model_type: &str) -> Result<Self> {
        let stem = model_type.to_lowercase();
        let invalid = |reason: &str| {
            Error::configuration(
                "model_path",
                format!("folder `{name}` is not a {model_type} model folder: {reason}"),
            )
        };

        let mut rest = name
            .strip_prefix(stem.as_str())
            .ok_or_else(|| invalid("missing model prefix"))?;

        let mut finetune_epochs = None;
        if let Some(head) = strip_marker(rest, FINETUNE_MARKER) {
            let (head, epochs) = split_trailing_int(head).ok_or_else(|| invalid("bad finetune count"))?;
            finetune_epochs = Some(epochs);
            rest = head;
        }

        let branch = if let Some(head) = strip_marker(rest, QUANTIZATION_MARKER) {
            let (head, modulus) =
                split_trailing_int(head).ok_or_else(|| invalid("bad quantization modulus"))?;
            rest = head;
            Some(CompressionBranch::Quantization { modulus })
        } else if let Some(head) = strip_marker(rest, COMPRESSION_MARKER) {
            let (head, compression) =
                split_trailing_int(head).ok_or_else(|| invalid("bad compression ratio"))?;
            let method = head
                .strip_prefix(TOKEN_SEPARATOR)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| invalid("missing pruning method"))?;
            rest = "";
            Some(CompressionBranch::Pruning {
                method: method.to_string(),
                compression,
            })
        } else {
            None
        };

        if !rest.is_empty() {
            return Err(invalid(&format!("unrecognized tokens `{rest}`")));
        }

        Ok(Self {
            stem,
            branch,
            finetune_epochs,
        })
    }

    /// Lower-cased model type the name starts with.
    #[must_use]
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Compression branch, if any.
    #[must_use]
    pub const fn branch(&self) -> Option<&CompressionBranch> {
        self.branch.as_ref()
    }

    /// Quantization modulus, if the name encodes one.
    #[must_use]
    pub const fn quantization(&self) -> Option<u32> {
        match self.branch {
            Some(CompressionBranch::Quantization { modulus }) => Some(modulus),
            _ => None,
        }
    }

    /// Pruning method, if the name encodes one.
    #[must_use]
    pub fn prune_method(&self) -> Option<&str> {
        match &self.branch {
            Some(CompressionBranch::Pruning { method, .. }) => Some(method),
            _ => None,
        }
    }

    /// Pruning compression ratio, if the name encodes one.
    #[must_use]
    pub const fn prune_compression(&self) -> Option<u32> {
        match self.branch {
            Some(CompressionBranch::Pruning { compression, .. }) => Some(compression),
            _ => None,
        }
    }

    /// Finetuning epochs, if the name encodes them.
    #[must_use]
    pub const fn finetune_epochs(&self) -> Option<u32> {
        self.finetune_epochs
    }

    /// True once a compression branch is part of the name. From then on the
    /// on-disk identity is fixed and resume disagreements are fatal.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.branch.is_some()
    }
}

impl fmt::Display for FolderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem)?;
        match &self.branch {
            Some(CompressionBranch::Quantization { modulus }) => {
                write!(f, "_{modulus}_{QUANTIZATION_MARKER}")?;
            }
            Some(CompressionBranch::Pruning {
                method,
                compression,
            }) => write!(f, "_{method}_{compression}_{COMPRESSION_MARKER}")?,
            None => {}
        }
        if let Some(epochs) = self.finetune_epochs {
            write!(f, "_{epochs}_{FINETUNE_MARKER}")?;
        }
        Ok(())
    }
}

/// Strip `_<marker>` from the end of `s`.
fn strip_marker<'a>(s: &'a str, marker: &str) -> Option<&'a str> {
    s.strip_suffix(marker)?.strip_suffix(TOKEN_SEPARATOR)
}

/// Split `<head>_<int>` into `(head, int)`.
fn split_trailing_int(s: &str) -> Option<(&str, u32)> {
    let (head, token) = s.rsplit_once(TOKEN_SEPARATOR)?;
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((head, token.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> crate::config::ExperimentConfigBuilder {
        ExperimentConfig::builder(0, "CIFAR10", "VGG")
    }

    #[test]
    fn test_plain_model_folder() {
        let name = FolderName::from_config(&config().build().unwrap()).unwrap();
        assert_eq!(name.to_string(), "vgg");
        assert!(!name.is_frozen());
    }

    #[test]
    fn test_pruning_folder() {
        let cfg = config().prune("L1", 4).finetune_epochs(5).build().unwrap();
        let name = FolderName::from_config(&cfg).unwrap();
        assert_eq!(name.to_string(), "vgg_L1_4_compression_5_finetune_iterations");
        assert!(name.is_frozen());
    }

    #[test]
    fn test_quantization_takes_precedence() {
        let cfg = config()
            .quantization(8)
            .prune("L1", 4)
            .finetune_epochs(2)
            .build()
            .unwrap();
        let name = FolderName::from_config(&cfg).unwrap();
        assert_eq!(name.to_string(), "vgg_8_quantization_2_finetune_iterations");
        assert_eq!(name.prune_method(), None);
    }

    #[test]
    fn test_zero_finetune_is_encoded() {
        let cfg = config().prune("L1", 4).finetune_epochs(0).build().unwrap();
        let name = FolderName::from_config(&cfg).unwrap();
        assert_eq!(name.to_string(), "vgg_L1_4_compression_0_finetune_iterations");
        assert_eq!(
            FolderName::parse(&name.to_string(), "VGG").unwrap().finetune_epochs(),
            Some(0)
        );
    }

    #[test]
    fn test_pruning_requires_finetune() {
        let cfg = config().prune("L1", 4).build().unwrap();
        let err = FolderName::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("finetune_epochs"));
    }

    #[test]
    fn test_pruning_requires_compression() {
        let mut cfg = config().finetune_epochs(3).build().unwrap();
        cfg.prune_method = Some("L1".to_string());
        let err = FolderName::from_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("prune_compression"));
    }

    #[test]
    fn test_parse_method_with_separator() {
        let name = FolderName::parse(
            "vgg_bn_drop_Global_Mag_Weight_8_compression_40_finetune_iterations",
            "vgg_bn_drop",
        )
        .unwrap();
        assert_eq!(name.prune_method(), Some("Global_Mag_Weight"));
        assert_eq!(name.prune_compression(), Some(8));
        assert_eq!(name.finetune_epochs(), Some(40));
    }

    #[test]
    fn test_parse_quantization() {
        let name = FolderName::parse("resnet20_8_quantization", "ResNet20").unwrap();
        assert_eq!(name.quantization(), Some(8));
        assert_eq!(name.finetune_epochs(), None);
    }

    #[test]
    fn test_parse_rejects_foreign_folder() {
        assert!(FolderName::parse("resnet20", "VGG").is_err());
        assert!(FolderName::parse("vgg_extra", "VGG").is_err());
        assert!(FolderName::parse("vgg_x_quantization", "VGG").is_err());
        assert!(FolderName::parse("vgg_4_compression", "VGG").is_err());
    }
}
