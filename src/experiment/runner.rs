//! Stage Runner - sequences train → prune → quantize → attack → evaluate → log

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::results::{ResultLogger, ResultRecord};
use super::stage::{Stage, StageRecord};
use super::state::{ExperimentState, ENCODE_ERROR_SENTINEL};
use crate::collaborator::{
    AttackReport, AttackRequest, Collaborators, EvaluateRequest, EvaluationReport, PruneRequest,
    QuantizeRequest, TrainRequest, TransferReport,
};
use crate::notify::{NoopNotifier, Notifier};
use crate::{Error, Result};

/// Attack used for the transfer stage when no `attack_method` is configured.
pub const DEFAULT_ATTACK_METHOD: &str = "pgd";

static NOOP: NoopNotifier = NoopNotifier;

/// Default attack parameters, overlaid by `attack_kwargs`.
#[must_use]
pub fn default_attack_params() -> Map<String, Value> {
    let Value::Object(params) = json!({
        "eps": 2.0 / 255.0,
        "eps_iter": 0.001,
        "nb_iter": 5,
        "norm": "inf",
    }) else {
        return Map::new();
    };
    params
}

/// Overlay `kwargs` on the default attack parameters.
///
/// Returns the parameters and the `train` flag, which is taken out of `kwargs`
/// rather than forwarded to the attack.
#[must_use]
pub fn attack_params(kwargs: Option<&Map<String, Value>>) -> (Map<String, Value>, bool) {
    let mut params = default_attack_params();
    let mut train = false;
    for (key, value) in kwargs.into_iter().flatten() {
        if key == "train" {
            train = value.as_bool().unwrap_or(false);
        } else {
            params.insert(key.clone(), value.clone());
        }
    }
    (params, train)
}

/// Format a duration in seconds as `HH:MM:SS`.
#[must_use]
pub fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Everything a completed run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Row appended to the result log.
    pub record: ResultRecord,
    /// Stages reached, in order.
    pub history: Vec<StageRecord>,
    /// Final model artifact.
    pub model_path: Option<PathBuf>,
    /// Evaluation of the final model.
    pub evaluation: EvaluationReport,
    /// Dedicated attack result, if one ran.
    pub attack: Option<AttackReport>,
    /// Transfer attack result, if one ran.
    pub transfer: Option<TransferReport>,
    /// Parameter snapshot written at the end of the run.
    pub params_file: PathBuf,
}

/// Runs the stages of one resolved experiment.
///
/// The runner borrows the [`ExperimentState`] and never changes its identity;
/// the only thing it tracks is the current model artifact, which training and
/// pruning replace.
pub struct StageRunner<'a> {
    state: &'a ExperimentState,
    collaborators: Collaborators<'a>,
    notifier: &'a dyn Notifier,
    verbose: bool,
    logger: ResultLogger,
    stage: Stage,
    model_path: Option<PathBuf>,
    history: Vec<StageRecord>,
    attacked: bool,
}

impl std::fmt::Debug for StageRunner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("name", &self.state.name())
            .field("stage", &self.stage)
            .field("model_path", &self.model_path)
            .field("attacked", &self.attacked)
            .finish_non_exhaustive()
    }
}

impl<'a> StageRunner<'a> {
    /// Create a runner for `state`, logging to the experiment's shared result log.
    #[must_use]
    pub fn new(state: &'a ExperimentState, collaborators: Collaborators<'a>) -> Self {
        Self {
            state,
            collaborators,
            notifier: &NOOP,
            verbose: false,
            logger: ResultLogger::new(&state.paths().logs),
            stage: Stage::NotStarted,
            model_path: state.config().model_path.clone(),
            history: Vec::new(),
            attacked: false,
        }
    }

    /// Send notifications to `notifier`; `verbose` adds one per completed stage.
    #[must_use]
    pub fn with_notifier(mut self, notifier: &'a dyn Notifier, verbose: bool) -> Self {
        self.notifier = notifier;
        self.verbose = verbose;
        self
    }

    /// Log results with `logger` instead of the experiment's default log.
    #[must_use]
    pub fn with_logger(mut self, logger: ResultLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Current stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Current model artifact.
    #[must_use]
    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    /// Stages reached so far.
    #[must_use]
    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    /// Decide which stages this run executes, checking every precondition up front.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precondition`] if a planned stage needs a model artifact
    /// that neither the configuration nor training will provide.
    pub fn plan(&self) -> Result<Vec<Stage>> {
        let state = self.state;
        let config = state.config();
        let transforms = config.prune_method.is_some() || config.quantization.is_some();
        let attack =
            config.attack_method.is_some() && !config.skip_attack && !config.only_transfer;

        let mut stages = Vec::new();
        if state.train_from_scratch() && !config.only_transfer {
            stages.push(Stage::Trained);
        }
        // With no transformation ahead, attack the model as it stands.
        if attack && !transforms {
            stages.push(Stage::Attacked);
        }
        if config.prune_method.is_some() && !config.only_transfer {
            stages.push(Stage::Pruned);
        }
        if config.quantization.is_some() && !config.only_transfer {
            stages.push(Stage::Quantized);
        }
        if attack && transforms {
            stages.push(Stage::Attacked);
        }
        if config.transfer_attack_model.is_some() {
            stages.push(Stage::TransferAttacked);
        }
        stages.push(Stage::Evaluated);
        stages.push(Stage::Logged);

        let has_model = self.model_path.is_some() || stages.contains(&Stage::Trained);
        if !has_model {
            if let Some(first) = stages.first() {
                return Err(Error::precondition(
                    *first,
                    "no model_path was supplied and no training was requested; \
                     provide a trained artifact or allow training from scratch",
                ));
            }
        }
        Ok(stages)
    }

    /// Execute the planned stages.
    ///
    /// Preconditions are checked before anything runs. A collaborator failure
    /// stops the run at the last completed stage; its artifacts stay on disk
    /// and can be picked up by a later resume.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before any collaborator runs, or
    /// [`Error::Collaborator`] with the collaborator's own error.
    pub fn run(mut self) -> Result<RunOutcome> {
        let stages = self.plan()?;
        let started = Utc::now();
        let name = self.state.name().to_string();

        self.notify(
            &format!("Experiment started for {name}"),
            &pretty(&self.state.params()),
        );

        let mut attack = None;
        let mut transfer = None;
        let mut evaluation = None;
        let mut record = None;

        for stage in stages {
            match stage {
                Stage::Trained => self.train()?,
                Stage::Pruned => self.prune()?,
                Stage::Quantized => self.quantize()?,
                Stage::Attacked => attack = Some(self.attack()?),
                Stage::TransferAttacked => transfer = Some(self.transfer_attack()?),
                Stage::Evaluated => evaluation = Some(self.evaluate()?),
                Stage::Logged => {
                    record = Some(self.log(
                        evaluation.as_ref(),
                        attack.as_ref(),
                        transfer.as_ref(),
                    )?);
                }
                Stage::NotStarted => {}
            }
        }

        let params = self.state.params_for(self.model_path.as_deref());
        let params_file = self.state.save_variables(&params)?;
        let elapsed = format_elapsed((Utc::now() - started).num_seconds());
        info!(name = %name, elapsed = %elapsed, "Experiment finished");
        self.notify(
            &format!("Experiment ended for {name}"),
            &format!("{}\n\nElapsed: {elapsed}", pretty(&params)),
        );

        Ok(RunOutcome {
            record: record.unwrap_or_else(|| ResultRecord::new(&params, None, None, None)),
            history: self.history,
            model_path: self.model_path,
            evaluation: evaluation.unwrap_or_default(),
            attack,
            transfer,
            params_file,
        })
    }

    fn train(&mut self) -> Result<()> {
        let started = self.enter(Stage::Trained)?;
        if let Some(path) = &self.model_path {
            return Err(Error::precondition(
                Stage::Trained,
                format!(
                    "training is done from scratch, but a pretrained model was provided: {}",
                    path.display()
                ),
            ));
        }

        let state = self.state;
        let config = state.config();
        let model_dir = &state.paths().model;
        let request = TrainRequest {
            dataset: &config.dataset,
            model_type: &config.model_type,
            path: model_dir,
            checkpoint_metric: config.best_model_metric.as_deref(),
            debug: config.debug,
            seed: config.seed,
            gpu: config.gpu,
            save_one_checkpoint: config.save_one_checkpoint,
        };
        let trainer = self.collaborators.trainer;
        trainer
            .train(&request)
            .map_err(|source| collaborator(Stage::Trained, source))?;
        let best = trainer
            .best_checkpoint(model_dir, config.best_model_metric.as_deref())
            .map_err(|source| collaborator(Stage::Trained, source))?;

        self.model_path = Some(best);
        self.complete(Stage::Trained, started);
        if self.verbose {
            self.notify(&format!("Training for {} completed.", self.state.name()), "");
        }
        Ok(())
    }

    fn prune(&mut self) -> Result<()> {
        let started = self.enter(Stage::Pruned)?;
        let state = self.state;
        let config = state.config();
        let resume_from = self.require_model(Stage::Pruned)?;
        let (Some(strategy), Some(compression), Some(finetune_epochs)) = (
            config.prune_method.as_deref(),
            config.prune_compression,
            config.finetune_epochs,
        ) else {
            return Err(Error::precondition(
                Stage::Pruned,
                "pruning needs prune_method, prune_compression and finetune_epochs",
            ));
        };
        info!(model_path = %resume_from.display(), strategy, compression, "Pruning model");

        let model_dir = &state.paths().model;
        let request = PruneRequest {
            dataset: &config.dataset,
            model_type: &config.model_type,
            strategy,
            compression,
            checkpoint_metric: config.best_model_metric.as_deref(),
            resume_from: &resume_from,
            path: model_dir,
            finetune_epochs,
            debug: config.debug,
            seed: config.seed,
            gpu: config.gpu,
            save_one_checkpoint: config.save_one_checkpoint,
        };
        let pruner = self.collaborators.pruner;
        pruner
            .prune(&request)
            .map_err(|source| collaborator(Stage::Pruned, source))?;
        let best = pruner
            .best_checkpoint(model_dir, config.best_model_metric.as_deref())
            .map_err(|source| collaborator(Stage::Pruned, source))?;

        self.model_path = Some(best);
        self.complete(Stage::Pruned, started);
        if self.verbose {
            self.notify(&format!("Pruning for {} completed.", self.state.name()), "");
        }
        Ok(())
    }

    fn quantize(&mut self) -> Result<()> {
        let started = self.enter(Stage::Quantized)?;
        let state = self.state;
        let config = state.config();
        let model_path = self.require_model(Stage::Quantized)?;
        let Some(modulus) = config.quantization else {
            return Err(Error::precondition(
                Stage::Quantized,
                "quantization modulus is not set",
            ));
        };

        let request = QuantizeRequest {
            dataset: &config.dataset,
            model_type: &config.model_type,
            modulus,
            model_path: &model_path,
            path: &state.paths().model,
            finetune_epochs: config.finetune_epochs,
            debug: config.debug,
            seed: config.seed,
            gpu: config.gpu,
        };
        let quantized = self
            .collaborators
            .quantizer
            .quantize(&request)
            .map_err(|source| collaborator(Stage::Quantized, source))?;

        if let Some(path) = quantized {
            self.model_path = Some(path);
        }
        self.complete(Stage::Quantized, started);
        if self.verbose {
            self.notify(
                &format!("Quantization for {} completed.", self.state.name()),
                "",
            );
        }
        Ok(())
    }

    fn attack(&mut self) -> Result<AttackReport> {
        let started = self.enter(Stage::Attacked)?;
        let state = self.state;
        let config = state.config();
        let model_path = self.require_model(Stage::Attacked)?;
        let method = config
            .attack_method
            .as_deref()
            .ok_or_else(|| Error::precondition(Stage::Attacked, "attack_method is not set"))?;
        let (params, train) = attack_params(config.attack_kwargs.as_ref());

        let request = AttackRequest {
            model_path: &model_path,
            model_type: &config.model_type,
            dataset: &config.dataset,
            attack_method: method,
            attack_params: &params,
            train,
            path: self.attack_dir(),
            transfer_model_path: None,
            gpu: config.gpu,
            seed: config.seed,
            debug: config.debug,
        };
        let report = self
            .collaborators
            .attacker
            .attack(&request)
            .map_err(|source| collaborator(Stage::Attacked, source))?;

        self.attacked = true;
        self.complete(Stage::Attacked, started);
        if self.verbose {
            let body = pretty(&report);
            self.notify(
                &format!("{method} attack on {} concluded.", config.model_type),
                &body,
            );
        }
        Ok(report)
    }

    fn transfer_attack(&mut self) -> Result<TransferReport> {
        let started = self.enter(Stage::TransferAttacked)?;
        let state = self.state;
        let config = state.config();
        let model_path = self.require_model(Stage::TransferAttacked)?;
        let transfer_model = config.transfer_attack_model.as_deref().ok_or_else(|| {
            Error::precondition(Stage::TransferAttacked, "transfer_attack_model is not set")
        })?;
        let method = config
            .attack_method
            .as_deref()
            .unwrap_or(DEFAULT_ATTACK_METHOD);
        let (params, train) = attack_params(config.attack_kwargs.as_ref());

        let request = AttackRequest {
            model_path: &model_path,
            model_type: &config.model_type,
            dataset: &config.dataset,
            attack_method: method,
            attack_params: &params,
            train,
            path: self.attack_dir(),
            transfer_model_path: Some(transfer_model),
            gpu: config.gpu,
            seed: config.seed,
            debug: config.debug,
        };
        let report = self
            .collaborators
            .attacker
            .transfer_attack(&request)
            .map_err(|source| collaborator(Stage::TransferAttacked, source))?;

        info!(
            source = %transfer_model.display(),
            source_successes = report.source_successes,
            both_successes = report.both_successes,
            ratio = ?report.success_ratio(),
            "Transfer attack finished"
        );
        self.complete(Stage::TransferAttacked, started);
        if self.verbose {
            let body = pretty(&report);
            self.notify(
                &format!("Transfer {method} attack on {} concluded.", config.model_type),
                &body,
            );
        }
        Ok(report)
    }

    fn evaluate(&mut self) -> Result<EvaluationReport> {
        let started = self.enter(Stage::Evaluated)?;
        let state = self.state;
        let config = state.config();
        let model_path = self.require_model(Stage::Evaluated)?;

        // One more adversarial pass only if no attack ran during this call.
        let eval_attack = config
            .attack_method
            .as_deref()
            .filter(|_| !self.attacked && !config.only_transfer);
        let params = eval_attack.map(|_| attack_params(config.attack_kwargs.as_ref()).0);

        let request = EvaluateRequest {
            model_type: &config.model_type,
            model_path: &model_path,
            dataset: &config.dataset,
            gpu: config.gpu,
            debug: config.debug,
            attack_method: eval_attack,
            attack_kwargs: params.as_ref(),
        };
        let report = self
            .collaborators
            .evaluator
            .evaluate(&request)
            .map_err(|source| collaborator(Stage::Evaluated, source))?;

        self.complete(Stage::Evaluated, started);
        Ok(report)
    }

    fn log(
        &mut self,
        evaluation: Option<&EvaluationReport>,
        attack: Option<&AttackReport>,
        transfer: Option<&TransferReport>,
    ) -> Result<ResultRecord> {
        let started = self.enter(Stage::Logged)?;
        let params = self.state.params_for(self.model_path.as_deref());
        let record = self.logger.append(&params, evaluation, attack, transfer)?;
        self.complete(Stage::Logged, started);
        Ok(record)
    }

    fn enter(&self, next: Stage) -> Result<DateTime<Utc>> {
        if !self.stage.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        info!(from = %self.stage, to = %next, "Starting stage");
        Ok(Utc::now())
    }

    fn complete(&mut self, stage: Stage, started_at: DateTime<Utc>) {
        let ended_at = Utc::now();
        info!(
            stage = %stage,
            elapsed = %format_elapsed((ended_at - started_at).num_seconds()),
            "Stage completed"
        );
        self.history.push(StageRecord {
            stage,
            started_at,
            ended_at,
        });
        self.stage = stage;
    }

    fn require_model(&self, stage: Stage) -> Result<PathBuf> {
        self.model_path.clone().ok_or_else(|| {
            Error::precondition(
                stage,
                "either a path to a trained model must be provided or training must be requested",
            )
        })
    }

    fn attack_dir(&self) -> &'a Path {
        let state: &'a ExperimentState = self.state;
        let paths = state.paths();
        paths.attack.as_deref().unwrap_or(&paths.model)
    }

    fn notify(&self, subject: &str, body: &str) {
        if let Err(e) = self.notifier.notify(subject, body) {
            warn!(subject, error = %e, "Notification failed");
        }
    }
}

fn collaborator(stage: Stage, source: anyhow::Error) -> Error {
    Error::Collaborator { stage, source }
}

/// Notification body for `value`, or the encode-error sentinel if it cannot be serialized.
fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| {
        warn!(error = %e, "Could not encode notification body");
        ENCODE_ERROR_SENTINEL.to_string()
    })
}
