//! External collaborator boundary
//!
//! Training, pruning, quantization, attacks and evaluation are performed by an
//! external framework. The core only sequences calls into it through the traits
//! below; every call is synchronous and may run for hours. Collaborator errors
//! are opaque (`anyhow::Error`) and are propagated to the caller verbatim.

mod command;

pub use command::CommandBackend;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arguments for a training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainRequest<'a> {
    /// Dataset identifier.
    pub dataset: &'a str,
    /// Model architecture.
    pub model_type: &'a str,
    /// Directory receiving checkpoints.
    pub path: &'a Path,
    /// Metric selecting the best checkpoint.
    pub checkpoint_metric: Option<&'a str>,
    /// Debug batch count.
    pub debug: Option<u32>,
    /// Seed.
    pub seed: Option<u64>,
    /// GPU index.
    pub gpu: Option<u32>,
    /// Keep only the latest checkpoint.
    pub save_one_checkpoint: bool,
}

/// Arguments for pruning and finetuning an existing artifact.
#[derive(Debug, Clone, Serialize)]
pub struct PruneRequest<'a> {
    /// Dataset identifier.
    pub dataset: &'a str,
    /// Model architecture.
    pub model_type: &'a str,
    /// Pruning strategy.
    pub strategy: &'a str,
    /// Compression ratio.
    pub compression: u32,
    /// Metric selecting the best checkpoint.
    pub checkpoint_metric: Option<&'a str>,
    /// Artifact to prune.
    pub resume_from: &'a Path,
    /// Directory receiving checkpoints.
    pub path: &'a Path,
    /// Finetuning epochs after pruning.
    pub finetune_epochs: u32,
    /// Debug batch count.
    pub debug: Option<u32>,
    /// Seed.
    pub seed: Option<u64>,
    /// GPU index.
    pub gpu: Option<u32>,
    /// Keep only the latest checkpoint.
    pub save_one_checkpoint: bool,
}

/// Arguments for quantizing an existing artifact.
#[derive(Debug, Clone, Serialize)]
pub struct QuantizeRequest<'a> {
    /// Dataset identifier.
    pub dataset: &'a str,
    /// Model architecture.
    pub model_type: &'a str,
    /// Quantization modulus.
    pub modulus: u32,
    /// Artifact to quantize.
    pub model_path: &'a Path,
    /// Directory receiving the quantized artifact.
    pub path: &'a Path,
    /// Finetuning epochs after quantization.
    pub finetune_epochs: Option<u32>,
    /// Debug batch count.
    pub debug: Option<u32>,
    /// Seed.
    pub seed: Option<u64>,
    /// GPU index.
    pub gpu: Option<u32>,
}

/// Arguments for an adversarial attack.
#[derive(Debug, Clone, Serialize)]
pub struct AttackRequest<'a> {
    /// Model under attack.
    pub model_path: &'a Path,
    /// Model architecture.
    pub model_type: &'a str,
    /// Dataset identifier.
    pub dataset: &'a str,
    /// Attack method.
    pub attack_method: &'a str,
    /// Attack parameters, defaults already applied.
    pub attack_params: &'a Map<String, Value>,
    /// Also attack the training split.
    pub train: bool,
    /// Directory receiving attack artifacts.
    pub path: &'a Path,
    /// Model the adversarial examples are crafted against, in transfer mode.
    pub transfer_model_path: Option<&'a Path>,
    /// GPU index.
    pub gpu: Option<u32>,
    /// Seed.
    pub seed: Option<u64>,
    /// Debug batch count.
    pub debug: Option<u32>,
}

/// Arguments for evaluating a model.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluateRequest<'a> {
    /// Model architecture.
    pub model_type: &'a str,
    /// Model to evaluate.
    pub model_path: &'a Path,
    /// Dataset identifier.
    pub dataset: &'a str,
    /// GPU index.
    pub gpu: Option<u32>,
    /// Debug batch count.
    pub debug: Option<u32>,
    /// Attack to run as part of evaluation, when none ran earlier.
    pub attack_method: Option<&'a str>,
    /// Parameters for that attack.
    pub attack_kwargs: Option<&'a Map<String, Value>>,
}

/// Adversarial accuracy reported by an attack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttackReport {
    /// Top-1 accuracy on adversarial inputs.
    #[serde(default)]
    pub adv_acc1: Option<f64>,
    /// Top-5 accuracy on adversarial inputs.
    #[serde(default)]
    pub adv_acc5: Option<f64>,
    /// Anything else the attacker reported.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outcome of a transfer attack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    /// Adversarial examples that fool the transfer source model.
    pub source_successes: u64,
    /// Of those, the ones that also fool the target model.
    pub both_successes: u64,
}

impl TransferReport {
    /// Fraction of source-fooling examples that also fool the target.
    /// `None` when nothing fooled the source.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_ratio(&self) -> Option<f64> {
        (self.source_successes > 0)
            .then(|| self.both_successes as f64 / self.source_successes as f64)
    }
}

/// Clean-accuracy and cost metrics of a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationReport {
    /// Top-1 clean accuracy.
    pub top1: Option<f64>,
    /// Top-5 clean accuracy.
    pub top5: Option<f64>,
    /// Parameter count.
    pub size: Option<f64>,
    /// Non-zero parameter count.
    pub size_nz: Option<f64>,
    /// `size / size_nz`.
    pub compression_ratio: Option<f64>,
    /// Floating-point operations per inference.
    pub flops: Option<f64>,
    /// Non-zero floating-point operations per inference.
    pub flops_nz: Option<f64>,
    /// `flops / flops_nz`.
    pub theoretical_speedup: Option<f64>,
    /// Adversarial results when evaluation ran an attack.
    pub adv_results: Option<AttackReport>,
}

/// Trains a model from scratch.
pub trait Trainer {
    /// Train, writing checkpoints under `request.path`.
    ///
    /// # Errors
    ///
    /// Any failure of the training framework.
    fn train(&self, request: &TrainRequest<'_>) -> anyhow::Result<()>;

    /// Best checkpoint under `path` by `metric`, or the last epoch's when `metric` is `None`.
    ///
    /// # Errors
    ///
    /// Any failure of the training framework, including no checkpoint found.
    fn best_checkpoint(&self, path: &Path, metric: Option<&str>) -> anyhow::Result<PathBuf>;
}

/// Prunes and finetunes an existing model.
pub trait Pruner {
    /// Prune `request.resume_from`, writing checkpoints under `request.path`.
    ///
    /// # Errors
    ///
    /// Any failure of the pruning framework.
    fn prune(&self, request: &PruneRequest<'_>) -> anyhow::Result<()>;

    /// Best post-finetune checkpoint under `path`.
    ///
    /// # Errors
    ///
    /// Any failure of the pruning framework, including no checkpoint found.
    fn best_checkpoint(&self, path: &Path, metric: Option<&str>) -> anyhow::Result<PathBuf>;
}

/// Quantizes an existing model.
pub trait Quantizer {
    /// Quantize `request.model_path`; returns the new artifact, if one was written.
    ///
    /// # Errors
    ///
    /// Any failure of the quantization framework.
    fn quantize(&self, request: &QuantizeRequest<'_>) -> anyhow::Result<Option<PathBuf>>;
}

/// Runs adversarial attacks.
pub trait Attacker {
    /// Attack `request.model_path` directly.
    ///
    /// # Errors
    ///
    /// Any failure of the attack framework.
    fn attack(&self, request: &AttackRequest<'_>) -> anyhow::Result<AttackReport>;

    /// Craft examples against `request.transfer_model_path` and replay them on
    /// `request.model_path`.
    ///
    /// # Errors
    ///
    /// Any failure of the attack framework.
    fn transfer_attack(&self, request: &AttackRequest<'_>) -> anyhow::Result<TransferReport>;
}

/// Evaluates a model.
pub trait Evaluator {
    /// Evaluate `request.model_path`.
    ///
    /// # Errors
    ///
    /// Any failure of the evaluation framework.
    fn evaluate(&self, request: &EvaluateRequest<'_>) -> anyhow::Result<EvaluationReport>;
}

/// The collaborators a run calls into.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Trainer.
    pub trainer: &'a dyn Trainer,
    /// Pruner.
    pub pruner: &'a dyn Pruner,
    /// Quantizer.
    pub quantizer: &'a dyn Quantizer,
    /// Attacker.
    pub attacker: &'a dyn Attacker,
    /// Evaluator.
    pub evaluator: &'a dyn Evaluator,
}

impl<'a> Collaborators<'a> {
    /// Use one backend for every role.
    pub fn uniform<B>(backend: &'a B) -> Self
    where
        B: Trainer + Pruner + Quantizer + Attacker + Evaluator,
    {
        Self {
            trainer: backend,
            pruner: backend,
            quantizer: backend,
            attacker: backend,
            evaluator: backend,
        }
    }
}

impl std::fmt::Debug for Collaborators<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_ratio() {
        let report = TransferReport {
            source_successes: 8,
            both_successes: 2,
        };
        assert_eq!(report.success_ratio(), Some(0.25));
        assert_eq!(TransferReport::default().success_ratio(), None);
    }

    #[test]
    fn test_attack_report_keeps_extra_fields() {
        let report: AttackReport = serde_json::from_value(serde_json::json!({
            "adv_acc1": 0.1,
            "runtime": 12
        }))
        .unwrap();
        assert_eq!(report.adv_acc1, Some(0.1));
        assert_eq!(report.adv_acc5, None);
        assert_eq!(report.extra["runtime"], 12);
    }
}
