//! Process-backed collaborators.
//!
//! Protocol: `<program> <args...> <subcommand>`, JSON request on stdin, JSON
//! reply on stdout. A non-zero exit status is a failure carrying stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{
    AttackReport, AttackRequest, Attacker, EvaluateRequest, EvaluationReport, Evaluator,
    PruneRequest, Pruner, QuantizeRequest, Quantizer, TrainRequest, Trainer, TransferReport,
};

/// Collaborators implemented by an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBackend {
    command: Vec<String>,
}

#[derive(Serialize)]
struct CheckpointQuery<'a> {
    path: &'a Path,
    metric: Option<&'a str>,
    stage: &'a str,
}

impl CommandBackend {
    /// Create a backend running `command` (program followed by leading arguments).
    #[must_use]
    pub const fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Program and leading arguments.
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    fn invoke<Req, Resp>(&self, subcommand: &str, request: &Req) -> anyhow::Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let (program, args) = self
            .command
            .split_first()
            .context("no collaborator command configured (set backend.command)")?;

        tracing::debug!(program, subcommand, "Invoking collaborator");
        let mut child = Command::new(program)
            .args(args)
            .arg(subcommand)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn `{program}`"))?;

        {
            let mut stdin = child.stdin.take().context("collaborator stdin unavailable")?;
            let payload = serde_json::to_vec(request)?;
            stdin
                .write_all(&payload)
                .with_context(|| format!("failed to send request to `{program} {subcommand}`"))?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "`{program} {subcommand}` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply = if stdout.trim().is_empty() {
            "null"
        } else {
            stdout.trim()
        };
        serde_json::from_str(reply)
            .with_context(|| format!("`{program} {subcommand}` replied with invalid JSON"))
    }
}

impl Trainer for CommandBackend {
    fn train(&self, request: &TrainRequest<'_>) -> anyhow::Result<()> {
        self.invoke::<_, Value>("train", request).map(drop)
    }

    fn best_checkpoint(&self, path: &Path, metric: Option<&str>) -> anyhow::Result<PathBuf> {
        let query = CheckpointQuery {
            path,
            metric,
            stage: "train",
        };
        self.invoke("best-checkpoint", &query)
    }
}

impl Pruner for CommandBackend {
    fn prune(&self, request: &PruneRequest<'_>) -> anyhow::Result<()> {
        self.invoke::<_, Value>("prune", request).map(drop)
    }

    fn best_checkpoint(&self, path: &Path, metric: Option<&str>) -> anyhow::Result<PathBuf> {
        let query = CheckpointQuery {
            path,
            metric,
            stage: "prune",
        };
        self.invoke("best-checkpoint", &query)
    }
}

impl Quantizer for CommandBackend {
    fn quantize(&self, request: &QuantizeRequest<'_>) -> anyhow::Result<Option<PathBuf>> {
        self.invoke("quantize", request)
    }
}

impl Attacker for CommandBackend {
    fn attack(&self, request: &AttackRequest<'_>) -> anyhow::Result<AttackReport> {
        self.invoke("attack", request)
    }

    fn transfer_attack(&self, request: &AttackRequest<'_>) -> anyhow::Result<TransferReport> {
        self.invoke("transfer-attack", request)
    }
}

impl Evaluator for CommandBackend {
    fn evaluate(&self, request: &EvaluateRequest<'_>) -> anyhow::Result<EvaluationReport> {
        self.invoke("evaluate", request)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandBackend {
        CommandBackend::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
        ])
    }

    #[test]
    fn test_reply_is_parsed() {
        let backend = sh(r#"cat > /dev/null; echo '{"top1": 0.91, "size": 1000}'"#);
        let request = EvaluateRequest {
            model_type: "VGG",
            model_path: Path::new("model.pt"),
            dataset: "CIFAR10",
            gpu: None,
            debug: None,
            attack_method: None,
            attack_kwargs: None,
        };
        let report = backend.evaluate(&request).unwrap();
        assert_eq!(report.top1, Some(0.91));
        assert_eq!(report.size, Some(1000.0));
        assert!(report.adv_results.is_none());
    }

    #[test]
    fn test_subcommand_is_last_argument() {
        let backend = sh(r#"cat > /dev/null; echo "\"/ckpt/$1.pt\"""#);
        let path = Trainer::best_checkpoint(&backend, Path::new("/ckpt"), None).unwrap();
        assert_eq!(path, PathBuf::from("/ckpt/best-checkpoint.pt"));
    }

    #[test]
    fn test_failure_carries_stderr() {
        let backend = sh("cat > /dev/null; echo 'CUDA out of memory' >&2; exit 3");
        let request = TrainRequest {
            dataset: "CIFAR10",
            model_type: "VGG",
            path: Path::new("/tmp"),
            checkpoint_metric: None,
            debug: None,
            seed: None,
            gpu: None,
            save_one_checkpoint: false,
        };
        let err = backend.train(&request).unwrap_err();
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    #[test]
    fn test_empty_command() {
        let backend = CommandBackend::new(Vec::new());
        let err = Quantizer::quantize(
            &backend,
            &QuantizeRequest {
                dataset: "CIFAR10",
                model_type: "VGG",
                modulus: 8,
                model_path: Path::new("m.pt"),
                path: Path::new("/tmp"),
                finetune_epochs: None,
                debug: None,
                seed: None,
                gpu: None,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("backend.command"));
    }
}
