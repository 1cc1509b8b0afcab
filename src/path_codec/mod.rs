//! Experiment identity: configuration ⇄ directory path
//!
//! An experiment is identified by where it lives on disk:
//!
//! ```text
//! <root>/experiments/experiment_<n>/<model_type>/<dataset>/<folder_name>/
//! ```
//!
//! [`PathCodec::build_path`] encodes a configuration into that layout and
//! creates it; [`infer_from_path`] decodes an existing artifact path back into
//! the configuration fields it captures. Two configurations with the same
//! encoded path are the same experiment.
//!
//! ## Example
//!
//! ```rust
//! use prunelab::config::ExperimentConfig;
//! use prunelab::path_codec::{infer_from_path, PathCodec, PathFragment};
//!
//! # fn main() -> prunelab::Result<()> {
//! let root = std::env::temp_dir().join("prunelab-doc");
//! let codec = PathCodec::new(&root);
//! let config = ExperimentConfig::builder(0, "CIFAR10", "VGG").quantization(8).build()?;
//!
//! let (paths, name) = codec.build_path(&config)?;
//! assert_eq!(name, "vgg_8_quantization");
//!
//! let inferred = infer_from_path(&paths.model, &PathFragment::default())?;
//! assert_eq!(inferred.fragment.quantization, Some(8));
//! # Ok(())
//! # }
//! ```

mod decode;
mod folder;

pub use decode::{decode, infer_from_path, Inference, PathFragment, EXPERIMENT_MARKER};
pub use folder::{
    CompressionBranch, FolderName, COMPRESSION_MARKER, FINETUNE_MARKER, QUANTIZATION_MARKER,
    TOKEN_SEPARATOR,
};

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ExperimentConfig;
use crate::Result;

/// Default environment variable naming the dataset root for the trainer.
pub const DEFAULT_DATA_ROOT_ENV: &str = "DATAPATH";

/// Concrete locations for every logical role of one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    /// Experiment root.
    pub root: PathBuf,
    /// `<root>/datasets`
    pub datasets: PathBuf,
    /// `<root>/experiments`
    pub experiments: PathBuf,
    /// `<root>/experiments/experiment_<n>`
    pub experiment: PathBuf,
    /// `<root>/datasets/<dataset>`
    pub dataset: PathBuf,
    /// `<experiment>/<model_type>`
    pub model_type: PathBuf,
    /// `<experiment>/<model_type>/<dataset>`
    pub model_dataset: PathBuf,
    /// `<model_dataset>/<folder_name>`; everything this run produces goes here.
    pub model: PathBuf,
    /// `<model>/attacks`, when an attack is configured.
    pub attacks: Option<PathBuf>,
    /// `<model>/attacks/<attack_method>`, when an attack is configured.
    pub attack: Option<PathBuf>,
    /// `<experiment>/experiment_<n>_logs.csv`; a file, shared by all runs of experiment `n`.
    pub logs: PathBuf,
}

impl ResolvedPaths {
    /// Directory roles in creation order.
    #[must_use]
    pub fn directories(&self) -> Vec<(&'static str, &Path)> {
        let mut dirs = vec![
            ("root", self.root.as_path()),
            ("datasets", self.datasets.as_path()),
            ("experiments", self.experiments.as_path()),
            ("experiment", self.experiment.as_path()),
            ("dataset", self.dataset.as_path()),
            ("model_type", self.model_type.as_path()),
            ("model_dataset", self.model_dataset.as_path()),
            ("model", self.model.as_path()),
        ];
        if let Some(attacks) = &self.attacks {
            dirs.push(("attacks", attacks.as_path()));
        }
        if let Some(attack) = &self.attack {
            dirs.push(("attack", attack.as_path()));
        }
        dirs
    }

    /// Look up a location by role name.
    #[must_use]
    pub fn get(&self, role: &str) -> Option<&Path> {
        if role == "logs" {
            return Some(&self.logs);
        }
        self.directories()
            .into_iter()
            .find_map(|(name, path)| (name == role).then_some(path))
    }

    fn create_all(&self) -> Result<()> {
        for (role, dir) in self.directories() {
            if !dir.exists() {
                debug!(role, path = %dir.display(), "Creating directory");
            }
            // create_dir_all tolerates a concurrent creator
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Encodes configurations into the on-disk layout under one root.
#[derive(Debug, Clone)]
pub struct PathCodec {
    root: PathBuf,
    data_root_env: String,
}

impl PathCodec {
    /// Create a codec rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            data_root_env: DEFAULT_DATA_ROOT_ENV.to_string(),
        }
    }

    /// Use a different environment variable for the dataset root.
    #[must_use]
    pub fn with_data_root_env(mut self, name: impl Into<String>) -> Self {
        self.data_root_env = name.into();
        self
    }

    /// Experiment root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the environment variable carrying the dataset root.
    #[must_use]
    pub fn data_root_env(&self) -> &str {
        &self.data_root_env
    }

    /// Compute the paths and folder name for `config` without touching the disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Configuration`] if the configuration cannot be encoded.
    pub fn plan(&self, config: &ExperimentConfig) -> Result<(ResolvedPaths, FolderName)> {
        let folder = FolderName::from_config(config)?;
        let experiment_dir = format!("{EXPERIMENT_MARKER}{}", config.experiment_number);

        let datasets = self.root.join("datasets");
        let experiments = self.root.join("experiments");
        let experiment = experiments.join(&experiment_dir);
        let model_type = experiment.join(&config.model_type);
        let model_dataset = model_type.join(&config.dataset);
        let model = model_dataset.join(folder.to_string());
        let attacks = config.attack_method.as_ref().map(|_| model.join("attacks"));
        let attack = attacks
            .as_ref()
            .zip(config.attack_method.as_ref())
            .map(|(attacks, method)| attacks.join(method));

        let paths = ResolvedPaths {
            root: self.root.clone(),
            dataset: datasets.join(&config.dataset),
            logs: experiment.join(format!("{experiment_dir}_logs.csv")),
            datasets,
            experiments,
            experiment,
            model_type,
            model_dataset,
            model,
            attacks,
            attack,
        };
        Ok((paths, folder))
    }

    /// Encode `config`, create every directory of the layout, and export the
    /// dataset root for the training collaborator.
    ///
    /// Idempotent: an existing model directory only produces a warning, since it
    /// may mean a previous run's artifacts are about to be overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Configuration`] if the configuration cannot be encoded,
    /// or [`crate::Error::Io`] if a directory cannot be created.
    pub fn build_path(&self, config: &ExperimentConfig) -> Result<(ResolvedPaths, String)> {
        let (paths, folder) = self.plan(config)?;

        if paths.model.exists() {
            warn!(path = %paths.model.display(), "Path already exists");
        }
        paths.create_all()?;
        self.export_data_root(&paths);

        Ok((paths, folder.to_string()))
    }

    /// The external trainer discovers datasets through a process-wide environment
    /// variable. This is the only global state the crate writes.
    fn export_data_root(&self, paths: &ResolvedPaths) {
        std::env::set_var(&self.data_root_env, &paths.datasets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_layout() {
        let codec = PathCodec::new("/tmp/root");
        let config = ExperimentConfig::builder(0, "CIFAR10", "VGG")
            .prune("L1", 4)
            .finetune_epochs(5)
            .attack("pgd")
            .build()
            .unwrap();
        let (paths, folder) = codec.plan(&config).unwrap();

        assert_eq!(
            paths.model,
            PathBuf::from(
                "/tmp/root/experiments/experiment_0/VGG/CIFAR10/vgg_L1_4_compression_5_finetune_iterations"
            )
        );
        assert_eq!(paths.dataset, PathBuf::from("/tmp/root/datasets/CIFAR10"));
        assert_eq!(
            paths.logs,
            PathBuf::from("/tmp/root/experiments/experiment_0/experiment_0_logs.csv")
        );
        assert_eq!(paths.attack, Some(paths.model.join("attacks").join("pgd")));
        assert_eq!(paths.get("attack"), paths.attack.as_deref());
        assert_eq!(paths.get("logs"), Some(paths.logs.as_path()));
        assert_eq!(folder.prune_compression(), Some(4));
    }

    #[test]
    fn test_no_attack_dirs_without_method() {
        let codec = PathCodec::new("/tmp/root");
        let config = ExperimentConfig::builder(1, "CIFAR10", "VGG").build().unwrap();
        let (paths, _) = codec.plan(&config).unwrap();
        assert!(paths.attacks.is_none());
        assert_eq!(paths.directories().len(), 8);
        assert!(paths.get("attack").is_none());
    }

    #[test]
    fn test_build_path_exports_data_root() {
        let dir = tempfile::tempdir().unwrap();
        let codec = PathCodec::new(dir.path()).with_data_root_env("PRUNELAB_TEST_DATAPATH");
        let config = ExperimentConfig::builder(0, "CIFAR10", "VGG").build().unwrap();
        let (paths, _) = codec.build_path(&config).unwrap();

        assert_eq!(
            std::env::var("PRUNELAB_TEST_DATAPATH").unwrap(),
            paths.datasets.to_string_lossy()
        );
        for (_, dir) in paths.directories() {
            assert!(dir.is_dir());
        }
        assert!(!paths.logs.exists());
    }
}
