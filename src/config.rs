//! Experiment configuration and runner settings
//!
//! [`ExperimentConfig`] describes one experiment as the caller supplied it.
//! When resuming, its compression and finetune fields may be left for the
//! resume path to supply. [`Settings`] configures the runner itself
//! and is loaded from layered sources with `figment`.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::path_codec::DEFAULT_DATA_ROOT_ENV;
use crate::{Error, Result};

/// File name of the workspace-level settings file, looked up under the root.
pub const SETTINGS_FILE: &str = "prunelab.toml";

/// Seed used when none is supplied.
pub const DEFAULT_SEED: u64 = 42;

/// One experiment as supplied by the caller.
///
/// `experiment_number`, `dataset` and `model_type` are always required. When
/// `resume` is true, an unset `quantization`, `prune_method`,
/// `prune_compression` or `finetune_epochs` is filled in from `model_path`;
/// see [`crate::experiment::ExperimentState::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// High-level experiment number; groups repeated runs of a whole sweep.
    pub experiment_number: u32,
    /// Dataset identifier, e.g. `CIFAR10`.
    pub dataset: String,
    /// Model architecture identifier, e.g. `VGG`.
    pub model_type: String,
    /// Pretrained artifact to start from. Training is skipped when set.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    /// Treat `model_path` as part of an existing experiment and infer unset fields from it.
    #[serde(default)]
    pub resume: bool,
    /// Metric selecting the best checkpoint; the last epoch is used when unset.
    #[serde(default)]
    pub best_model_metric: Option<String>,
    /// Quantization modulus.
    #[serde(default)]
    pub quantization: Option<u32>,
    /// Pruning strategy.
    #[serde(default)]
    pub prune_method: Option<String>,
    /// Ratio of parameters in the original to the pruned model.
    #[serde(default)]
    pub prune_compression: Option<u32>,
    /// Training epochs after pruning or quantization.
    #[serde(default)]
    pub finetune_epochs: Option<u32>,
    /// Method for generating adversarial inputs.
    #[serde(default)]
    pub attack_method: Option<String>,
    /// Extra attack parameters, overlaid on the defaults.
    #[serde(default)]
    pub attack_kwargs: Option<Map<String, Value>>,
    /// Skip the dedicated attack stages.
    #[serde(default)]
    pub skip_attack: bool,
    /// Only run the transfer attack against an already-resolved model.
    #[serde(default)]
    pub only_transfer: bool,
    /// Source model for the transfer attack.
    #[serde(default)]
    pub transfer_attack_model: Option<PathBuf>,
    /// Do not train even when no `model_path` is given.
    #[serde(default)]
    pub skip_train: bool,
    /// GPU index handed to collaborators.
    #[serde(default)]
    pub gpu: Option<u32>,
    /// Batches per epoch in debug mode; `false`/absent disables it.
    #[serde(default, deserialize_with = "deserialize_debug")]
    pub debug: Option<u32>,
    /// Seed for collaborators' random number generators.
    #[serde(default = "default_seed")]
    pub seed: Option<u64>,
    /// Keep only the latest checkpoint on disk.
    #[serde(default)]
    pub save_one_checkpoint: bool,
}

#[allow(clippy::unnecessary_wraps)]
const fn default_seed() -> Option<u64> {
    Some(DEFAULT_SEED)
}

/// Accepts `false`, `true` (one batch), an integer, or null.
fn deserialize_debug<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Debug {
        Flag(bool),
        Batches(u32),
    }

    Ok(match Option::<Debug>::deserialize(deserializer)? {
        None | Some(Debug::Flag(false)) | Some(Debug::Batches(0)) => None,
        Some(Debug::Flag(true)) => Some(1),
        Some(Debug::Batches(n)) => Some(n),
    })
}

impl ExperimentConfig {
    /// Create a builder with the required identity fields.
    #[must_use]
    pub fn builder(
        experiment_number: u32,
        dataset: impl Into<String>,
        model_type: impl Into<String>,
    ) -> ExperimentConfigBuilder {
        ExperimentConfigBuilder::new(experiment_number, dataset, model_type)
    }

    /// Load a configuration from a TOML or JSON file (chosen by extension).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not describe a valid request.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = if path.extension().is_some_and(|ext| ext == "json") {
            Figment::from(figment::providers::Json::file(path))
        } else {
            Figment::from(Toml::file(path))
        };
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate_request()?;
        Ok(config)
    }

    /// Check the field constraints that hold regardless of what a resume may fill in.
    ///
    /// Pruning completeness (`prune_compression`, `finetune_epochs`) is checked at path
    /// construction instead, since a resume can still supply those from the path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first offending field.
    pub fn validate_request(&self) -> Result<()> {
        if self.only_transfer {
            if !self.resume {
                return Err(Error::configuration(
                    "only_transfer",
                    "only_transfer requires resume = true",
                ));
            }
            if self.model_path.is_none() {
                return Err(Error::configuration(
                    "only_transfer",
                    "only_transfer requires model_path",
                ));
            }
            if self.transfer_attack_model.is_none() {
                return Err(Error::configuration(
                    "only_transfer",
                    "only_transfer requires transfer_attack_model",
                ));
            }
        }
        if self.quantization == Some(0) {
            return Err(Error::configuration(
                "quantization",
                "quantization modulus must be positive",
            ));
        }
        if let Some(compression) = self.prune_compression {
            if compression <= 1 {
                return Err(Error::configuration(
                    "prune_compression",
                    format!("compression must be greater than 1, got {compression}"),
                ));
            }
        }
        for (field, value) in [
            ("dataset", Some(&self.dataset)),
            ("model_type", Some(&self.model_type)),
            ("prune_method", self.prune_method.as_ref()),
            ("attack_method", self.attack_method.as_ref()),
        ] {
            if let Some(value) = value {
                if value.is_empty() || value.contains(['/', '\\']) {
                    return Err(Error::configuration(
                        field,
                        format!("`{value}` is not a valid path segment"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`ExperimentConfig`].
#[derive(Debug)]
pub struct ExperimentConfigBuilder {
    config: ExperimentConfig,
}

impl ExperimentConfigBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(
        experiment_number: u32,
        dataset: impl Into<String>,
        model_type: impl Into<String>,
    ) -> Self {
        Self {
            config: ExperimentConfig {
                experiment_number,
                dataset: dataset.into(),
                model_type: model_type.into(),
                model_path: None,
                resume: false,
                best_model_metric: None,
                quantization: None,
                prune_method: None,
                prune_compression: None,
                finetune_epochs: None,
                attack_method: None,
                attack_kwargs: None,
                skip_attack: false,
                only_transfer: false,
                transfer_attack_model: None,
                skip_train: false,
                gpu: None,
                debug: None,
                seed: Some(DEFAULT_SEED),
                save_one_checkpoint: false,
            },
        }
    }

    /// Start from a pretrained artifact.
    #[must_use]
    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = Some(path.into());
        self
    }

    /// Resume the experiment `path` belongs to.
    #[must_use]
    pub fn resume_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = Some(path.into());
        self.config.resume = true;
        self
    }

    /// Set the best-checkpoint metric.
    #[must_use]
    pub fn best_model_metric(mut self, metric: impl Into<String>) -> Self {
        self.config.best_model_metric = Some(metric.into());
        self
    }

    /// Set the quantization modulus.
    #[must_use]
    pub const fn quantization(mut self, modulus: u32) -> Self {
        self.config.quantization = Some(modulus);
        self
    }

    /// Set the pruning strategy and compression ratio.
    #[must_use]
    pub fn prune(mut self, method: impl Into<String>, compression: u32) -> Self {
        self.config.prune_method = Some(method.into());
        self.config.prune_compression = Some(compression);
        self
    }

    /// Set the number of finetuning epochs.
    #[must_use]
    pub const fn finetune_epochs(mut self, epochs: u32) -> Self {
        self.config.finetune_epochs = Some(epochs);
        self
    }

    /// Set the attack method.
    #[must_use]
    pub fn attack(mut self, method: impl Into<String>) -> Self {
        self.config.attack_method = Some(method.into());
        self
    }

    /// Set extra attack parameters.
    #[must_use]
    pub fn attack_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.config.attack_kwargs = Some(kwargs);
        self
    }

    /// Skip the dedicated attack stages.
    #[must_use]
    pub const fn skip_attack(mut self, skip: bool) -> Self {
        self.config.skip_attack = skip;
        self
    }

    /// Set the transfer attack source model.
    #[must_use]
    pub fn transfer_attack_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.transfer_attack_model = Some(path.into());
        self
    }

    /// Only run the transfer attack.
    #[must_use]
    pub const fn only_transfer(mut self, only: bool) -> Self {
        self.config.only_transfer = only;
        self
    }

    /// Do not train even without a pretrained artifact.
    #[must_use]
    pub const fn skip_train(mut self, skip: bool) -> Self {
        self.config.skip_train = skip;
        self
    }

    /// Set the GPU index.
    #[must_use]
    pub const fn gpu(mut self, gpu: u32) -> Self {
        self.config.gpu = Some(gpu);
        self
    }

    /// Enable debug mode with the given number of batches.
    #[must_use]
    pub const fn debug(mut self, batches: u32) -> Self {
        self.config.debug = if batches == 0 { None } else { Some(batches) };
        self
    }

    /// Set the seed.
    #[must_use]
    pub const fn seed(mut self, seed: Option<u64>) -> Self {
        self.config.seed = seed;
        self
    }

    /// Keep only the latest checkpoint.
    #[must_use]
    pub const fn save_one_checkpoint(mut self, keep_one: bool) -> Self {
        self.config.save_one_checkpoint = keep_one;
        self
    }

    /// Build the `ExperimentConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the request is inconsistent.
    pub fn build(self) -> Result<ExperimentConfig> {
        self.config.validate_request()?;
        Ok(self.config)
    }
}

/// Runner-level settings.
///
/// Priority (highest to lowest):
/// 1. Environment variables prefixed with `PRUNELAB_` (`PRUNELAB_NOTIFY__VERBOSE=true`)
/// 2. An explicit settings file
/// 3. `<root>/prunelab.toml`
/// 4. Built-in defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Experiment root; `datasets/` and `experiments/` live directly under it.
    pub root: PathBuf,
    /// Environment variable through which the dataset root reaches the trainer.
    pub data_root_env: String,
    /// Notification settings.
    pub notify: NotifySettings,
    /// External collaborator settings.
    pub backend: BackendSettings,
    /// Logging settings.
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            data_root_env: DEFAULT_DATA_ROOT_ENV.to_string(),
            notify: NotifySettings::default(),
            backend: BackendSettings::default(),
            log: LogSettings::default(),
        }
    }
}

/// Notification settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    /// Also notify at the end of each stage, not only at start and end of a run.
    pub verbose: bool,
    /// Program and leading arguments; the subject is appended and the body piped to stdin.
    pub command: Vec<String>,
}

/// External collaborator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Program and leading arguments implementing the collaborator protocol.
    pub command: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from layered sources rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Settings`] if a source exists but cannot be parsed.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let defaults = Self {
            root: root.to_path_buf(),
            ..Self::default()
        };
        let mut figment = Figment::from(Serialized::defaults(defaults));

        let workspace = root.join(SETTINGS_FILE);
        if workspace.exists() {
            figment = figment.merge(Toml::file(&workspace));
        }
        if let Some(path) = explicit {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("PRUNELAB_").split("__"));

        figment.extract().map_err(|e| Error::Settings(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ExperimentConfig::builder(0, "CIFAR10", "VGG").build().unwrap();
        assert_eq!(config.seed, Some(DEFAULT_SEED));
        assert!(config.model_path.is_none());
        assert!(!config.resume);
    }

    #[test]
    fn test_only_transfer_requires_companions() {
        let err = ExperimentConfig::builder(0, "CIFAR10", "VGG")
            .only_transfer(true)
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("resume"));

        let err = ExperimentConfig::builder(0, "CIFAR10", "VGG")
            .resume_from("experiments/experiment_0/VGG/CIFAR10/vgg/best.pt")
            .only_transfer(true)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("transfer_attack_model"));

        let ok = ExperimentConfig::builder(0, "CIFAR10", "VGG")
            .resume_from("experiments/experiment_0/VGG/CIFAR10/vgg/best.pt")
            .transfer_attack_model("other.pt")
            .only_transfer(true)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_compression_must_exceed_one() {
        let err = ExperimentConfig::builder(0, "CIFAR10", "VGG")
            .prune("L1", 1)
            .finetune_epochs(5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("prune_compression"));
    }

    #[test]
    fn test_zero_quantization_rejected() {
        let err = ExperimentConfig::builder(0, "CIFAR10", "VGG")
            .quantization(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("quantization"));
    }

    #[test]
    fn test_separator_in_identifier_rejected() {
        let err = ExperimentConfig::builder(0, "CIFAR/10", "VGG").build().unwrap_err();
        assert!(err.to_string().contains("dataset"));
    }

    #[test]
    fn test_debug_accepts_false_and_integer() {
        let config: ExperimentConfig = serde_json::from_value(serde_json::json!({
            "experiment_number": 1,
            "dataset": "CIFAR10",
            "model_type": "VGG",
            "debug": false
        }))
        .unwrap();
        assert_eq!(config.debug, None);
        assert_eq!(config.seed, Some(DEFAULT_SEED));

        let config: ExperimentConfig = serde_json::from_value(serde_json::json!({
            "experiment_number": 1,
            "dataset": "CIFAR10",
            "model_type": "VGG",
            "debug": 3
        }))
        .unwrap();
        assert_eq!(config.debug, Some(3));
    }

    #[test]
    fn test_identity_fields_required_when_resuming() {
        let err = serde_json::from_value::<ExperimentConfig>(serde_json::json!({
            "experiment_number": 1,
            "model_type": "VGG",
            "model_path": "experiments/experiment_1/VGG/CIFAR10/vgg/best.pt",
            "resume": true
        }))
        .unwrap_err();
        assert!(err.to_string().contains("dataset"));
    }

    #[test]
    fn test_settings_default_data_root_env() {
        assert_eq!(Settings::default().data_root_env, DEFAULT_DATA_ROOT_ENV);
        let codec = crate::path_codec::PathCodec::new("/srv/prunelab");
        assert_eq!(codec.data_root_env(), Settings::default().data_root_env);
    }

    #[test]
    fn test_settings_layering() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "data_root_env = \"SHRINKBENCH_DATA\"\n[notify]\nverbose = true\n",
        )
        .unwrap();

        let settings = Settings::load(dir.path(), None).unwrap();
        assert_eq!(settings.root, dir.path());
        assert_eq!(settings.data_root_env, "SHRINKBENCH_DATA");
        assert!(settings.notify.verbose);
        assert_eq!(settings.log.filter, "info");
    }
}
