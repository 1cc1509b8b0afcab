//! Experiment State - resolved identity and configuration of one run

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::path_codec::{infer_from_path, PathCodec, PathFragment, ResolvedPaths};
use crate::Result;

/// Written in place of a field that cannot be JSON-encoded.
pub const ENCODE_ERROR_SENTINEL: &str = "json encode error";

/// Prefix of parameter snapshot files in the model directory.
pub const PARAMS_FILE_PREFIX: &str = "experiment_params_";

const MAX_SNAPSHOT_SUFFIX: u32 = 1000;

/// One experiment's configuration after resolution and validation.
///
/// Resolution is the only place that decides whether a run resumes an existing
/// experiment or starts a fresh one:
///
/// | `model_path` | `resume` | behaviour                                   | train from scratch |
/// |--------------|----------|---------------------------------------------|--------------------|
/// | unset        | any      | encode supplied fields                      | unless `skip_train`|
/// | set          | false    | fresh experiment seeded from the artifact   | no                 |
/// | set          | true     | decode path, reconcile, then encode         | no                 |
///
/// The resolved state is immutable; a partially inferred configuration is never exposed.
#[derive(Debug, Clone)]
pub struct ExperimentState {
    config: ExperimentConfig,
    paths: ResolvedPaths,
    name: String,
    train_from_scratch: bool,
    already_pruned: bool,
    already_quantized: bool,
}

impl ExperimentState {
    /// Resolve `config` against the layout managed by `codec`, creating its directories.
    ///
    /// All validation happens before any directory is created.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the request is inconsistent or contradicts
    /// the path it resumes from, or an IO error if the layout cannot be created.
    pub fn resolve(config: ExperimentConfig, codec: &PathCodec) -> Result<Self> {
        config.validate_request()?;

        let mut config = config;
        let mut already_pruned = false;
        let mut already_quantized = false;

        match (config.model_path.clone(), config.resume) {
            (Some(model_path), true) => {
                let inference = infer_from_path(&model_path, &PathFragment::from(&config))?;
                already_pruned = inference.already_pruned;
                already_quantized = inference.already_quantized;
                inference.fragment.apply_to(&mut config)?;
                config.validate_request()?;
                info!(
                    model_path = %model_path.display(),
                    already_pruned,
                    already_quantized,
                    "Resuming experiment"
                );
            }
            (None, true) => {
                warn!("Resume requested without a model_path; starting a fresh experiment");
            }
            _ => {}
        }

        let (paths, name) = codec.build_path(&config)?;
        let train_from_scratch = config.model_path.is_none() && !config.skip_train;

        if let Some(batches) = config.debug {
            warn!(
                debug = batches,
                "Debug mode is on. Results will not be valid with this setting"
            );
        }

        let state = Self {
            config,
            paths,
            name,
            train_from_scratch,
            already_pruned,
            already_quantized,
        };
        state.save_variables(&state.params())?;
        Ok(state)
    }

    /// Resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Resolved directory layout.
    #[must_use]
    pub const fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    /// Canonical model folder name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the run trains a model from scratch.
    #[must_use]
    pub const fn train_from_scratch(&self) -> bool {
        self.train_from_scratch
    }

    /// The resumed artifact's folder already encodes pruning.
    #[must_use]
    pub const fn already_pruned(&self) -> bool {
        self.already_pruned
    }

    /// The resumed artifact's folder already encodes quantization.
    #[must_use]
    pub const fn already_quantized(&self) -> bool {
        self.already_quantized
    }

    /// Flat serialization of the full configuration.
    #[must_use]
    pub fn params(&self) -> Map<String, Value> {
        self.params_for(self.config.model_path.as_deref())
    }

    /// Like [`Self::params`], with `model_path` replaced by the artifact a run produced.
    #[must_use]
    pub fn params_for(&self, model_path: Option<&Path>) -> Map<String, Value> {
        let c = &self.config;
        let path_string = |p: Option<&Path>| p.map(|p| p.to_string_lossy().into_owned());

        let mut params = Map::new();
        put(&mut params, "name", &self.name);
        put(&mut params, "experiment_number", &c.experiment_number);
        put(&mut params, "dataset", &c.dataset);
        put(&mut params, "model_type", &c.model_type);
        put(&mut params, "model_path", &path_string(model_path));
        put(&mut params, "resume", &c.resume);
        put(&mut params, "best_model_metric", &c.best_model_metric);
        put(&mut params, "quantization", &c.quantization);
        put(&mut params, "prune_method", &c.prune_method);
        put(&mut params, "prune_compression", &c.prune_compression);
        put(&mut params, "finetune_epochs", &c.finetune_epochs);
        put(&mut params, "attack_method", &c.attack_method);
        put(&mut params, "attack_kwargs", &c.attack_kwargs);
        put(&mut params, "skip_attack", &c.skip_attack);
        put(&mut params, "only_transfer", &c.only_transfer);
        put(
            &mut params,
            "transfer_attack_model",
            &path_string(c.transfer_attack_model.as_deref()),
        );
        put(&mut params, "skip_train", &c.skip_train);
        put(&mut params, "gpu", &c.gpu);
        put(&mut params, "debug", &c.debug);
        put(&mut params, "seed", &c.seed);
        put(&mut params, "save_one_checkpoint", &c.save_one_checkpoint);
        put(&mut params, "train_from_scratch", &self.train_from_scratch);
        put(&mut params, "already_pruned", &self.already_pruned);
        put(&mut params, "already_quantized", &self.already_quantized);
        put(
            &mut params,
            "model_dir",
            &self.paths.model.to_string_lossy().into_owned(),
        );
        params
    }

    /// Write `params` to a new timestamped JSON file in the model directory.
    ///
    /// Never overwrites: a colliding name gets a numeric suffix.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be written.
    pub fn save_variables(&self, params: &Map<String, Value>) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.6f").to_string();
        let contents = serde_json::to_string_pretty(params)?;

        for attempt in 0..MAX_SNAPSHOT_SUFFIX {
            let file_name = if attempt == 0 {
                format!("{PARAMS_FILE_PREFIX}{stamp}.json")
            } else {
                format!("{PARAMS_FILE_PREFIX}{stamp}-{attempt}.json")
            };
            let path = self.paths.model.join(file_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(contents.as_bytes())?;
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free parameter snapshot name for {stamp}"),
        )
        .into())
    }
}

/// Insert `value` under `key`, substituting the sentinel if it cannot be encoded.
fn put<T: Serialize + ?Sized>(params: &mut Map<String, Value>, key: &str, value: &T) {
    let encoded = serde_json::to_value(value).unwrap_or_else(|e| {
        warn!(field = key, error = %e, "Could not encode parameter");
        Value::String(ENCODE_ERROR_SENTINEL.to_string())
    });
    params.insert(key.to_string(), encoded);
}
