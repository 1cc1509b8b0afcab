//! Result Record - one rectangular row per completed run
//!
//! Rows are appended to `experiment_<n>_logs.csv`, shared by every run of the
//! same high-level experiment. The header is written once, by whichever writer
//! publishes the file; every row has exactly [`COLUMNS`] cells.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::{Map, Value};

use crate::collaborator::{AttackReport, EvaluationReport, TransferReport};
use crate::Result;

/// Cell written for a column without a value.
pub const NULL_SENTINEL: &str = "null";

/// Fixed column order of the result log.
pub const COLUMNS: &[&str] = &[
    "timestamp",
    "name",
    "experiment_number",
    "dataset",
    "model_type",
    "model_path",
    "resume",
    "best_model_metric",
    "quantization",
    "prune_method",
    "prune_compression",
    "finetune_epochs",
    "attack_method",
    "attack_kwargs",
    "skip_attack",
    "only_transfer",
    "transfer_attack_model",
    "skip_train",
    "gpu",
    "debug",
    "seed",
    "save_one_checkpoint",
    "train_from_scratch",
    "already_pruned",
    "already_quantized",
    "top1",
    "top5",
    "size",
    "size_nz",
    "compression_ratio",
    "flops",
    "flops_nz",
    "theoretical_speedup",
    "adv_acc1",
    "adv_acc5",
    "transfer_source_successes",
    "transfer_both_successes",
    "transfer_success_ratio",
];

/// One row of the result log, aligned with [`COLUMNS`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    values: Vec<Value>,
}

impl ResultRecord {
    /// Build a record from the run's configuration and its stage outcomes.
    ///
    /// Attack accuracy comes from the dedicated attack when one ran, otherwise
    /// from the adversarial pass of the evaluation.
    #[must_use]
    pub fn new(
        params: &Map<String, Value>,
        evaluation: Option<&EvaluationReport>,
        attack: Option<&AttackReport>,
        transfer: Option<&TransferReport>,
    ) -> Self {
        let mut fields = params.clone();
        fields.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        if let Some(evaluation) = evaluation {
            for (key, value) in [
                ("top1", evaluation.top1),
                ("top5", evaluation.top5),
                ("size", evaluation.size),
                ("size_nz", evaluation.size_nz),
                ("compression_ratio", evaluation.compression_ratio),
                ("flops", evaluation.flops),
                ("flops_nz", evaluation.flops_nz),
                ("theoretical_speedup", evaluation.theoretical_speedup),
            ] {
                fields.insert(key.to_string(), number(value));
            }
        }

        if let Some(adv) = attack.or_else(|| evaluation.and_then(|e| e.adv_results.as_ref())) {
            fields.insert("adv_acc1".to_string(), number(adv.adv_acc1));
            fields.insert("adv_acc5".to_string(), number(adv.adv_acc5));
        }

        if let Some(transfer) = transfer {
            fields.insert(
                "transfer_source_successes".to_string(),
                Value::from(transfer.source_successes),
            );
            fields.insert(
                "transfer_both_successes".to_string(),
                Value::from(transfer.both_successes),
            );
            fields.insert(
                "transfer_success_ratio".to_string(),
                number(transfer.success_ratio()),
            );
        }

        let values = COLUMNS
            .iter()
            .map(|column| fields.remove(*column).unwrap_or(Value::Null))
            .collect();
        Self { values }
    }

    /// Value of `column`, or `None` if it is not part of the schema.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        COLUMNS
            .iter()
            .position(|c| *c == column)
            .map(|index| &self.values[index])
    }

    /// Values in column order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// CSV cells in column order.
    #[must_use]
    pub fn cells(&self) -> Vec<String> {
        self.values.iter().map(cell).collect()
    }
}

fn number(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => NULL_SENTINEL.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Append-only writer for a result log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLogger {
    path: PathBuf,
}

impl ResultLogger {
    /// Create a logger appending to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build a record and append it as one row.
    ///
    /// # Errors
    ///
    /// Returns an IO or CSV error if the row cannot be written.
    pub fn append(
        &self,
        params: &Map<String, Value>,
        evaluation: Option<&EvaluationReport>,
        attack: Option<&AttackReport>,
        transfer: Option<&TransferReport>,
    ) -> Result<ResultRecord> {
        let record = ResultRecord::new(params, evaluation, attack, transfer);
        self.write(&record)?;
        Ok(record)
    }

    /// Append `record`, writing the header first if this call creates the file.
    ///
    /// A new log is staged as header plus row in a sibling temp file and
    /// published with a hard link, which fails if the log already exists. The
    /// log therefore never exists without its header, and of several writers
    /// racing on a missing file exactly one publishes it. The losers, and
    /// every later writer, append the row alone in a single `O_APPEND` write.
    ///
    /// # Errors
    ///
    /// Returns an IO or CSV error if the row cannot be written.
    pub fn write(&self, record: &ResultRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let row = encode(None, record)?;
        if self.path.exists() {
            return self.append_row(&row);
        }
        let first = encode(Some(COLUMNS), record)?;

        let staged = self.staging_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged)?;
        let published = file
            .write_all(&first)
            .and_then(|()| file.sync_data())
            .and_then(|()| std::fs::hard_link(&staged, &self.path));
        drop(file);
        let _ = std::fs::remove_file(&staged);

        match published {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "Created result log");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self.append_row(&row),
            Err(e) => Err(e.into()),
        }
    }

    fn append_row(&self, row: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(row)?;
        file.flush()?;
        tracing::info!(path = %self.path.display(), "Appended result row");
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let file_name = self
            .path
            .file_name()
            .map_or_else(|| "results".into(), |n| n.to_string_lossy());
        let staged = format!(
            ".{file_name}.{}.{}.tmp",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        self.path.with_file_name(staged)
    }
}

/// Serialize `record` as one CSV line, preceded by `header` when given.
fn encode(header: Option<&[&str]>, record: &ResultRecord) -> Result<Vec<u8>> {
    let mut buffer = csv::Writer::from_writer(Vec::new());
    if let Some(header) = header {
        buffer.write_record(header)?;
    }
    buffer.write_record(record.cells())?;
    Ok(buffer.into_inner().map_err(|e| e.into_error())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_columns_are_null() {
        let record = ResultRecord::new(&Map::new(), None, None, None);
        assert_eq!(record.values().len(), COLUMNS.len());
        assert_eq!(record.get("top1"), Some(&Value::Null));
        assert!(record.get("timestamp").unwrap().is_string());
        assert!(record.get("not_a_column").is_none());
        assert_eq!(record.cells()[COLUMNS.len() - 1], NULL_SENTINEL);
    }

    #[test]
    fn test_attack_report_preferred_over_evaluation() {
        let evaluation = EvaluationReport {
            top1: Some(0.9),
            adv_results: Some(AttackReport {
                adv_acc1: Some(0.2),
                ..AttackReport::default()
            }),
            ..EvaluationReport::default()
        };
        let attack = AttackReport {
            adv_acc1: Some(0.1),
            adv_acc5: Some(0.3),
            ..AttackReport::default()
        };

        let record = ResultRecord::new(&Map::new(), Some(&evaluation), Some(&attack), None);
        assert_eq!(record.get("adv_acc1"), Some(&Value::from(0.1)));

        let record = ResultRecord::new(&Map::new(), Some(&evaluation), None, None);
        assert_eq!(record.get("adv_acc1"), Some(&Value::from(0.2)));
        assert_eq!(record.get("adv_acc5"), Some(&Value::Null));
    }

    #[test]
    fn test_unknown_params_dropped() {
        let mut params = Map::new();
        params.insert("dataset".to_string(), Value::from("CIFAR10"));
        params.insert("model_dir".to_string(), Value::from("/srv/models/vgg"));
        let record = ResultRecord::new(&params, None, None, None);
        assert_eq!(record.get("dataset"), Some(&Value::from("CIFAR10")));
        assert!(record.get("model_dir").is_none());
        assert_eq!(record.values().len(), COLUMNS.len());
    }

    #[test]
    fn test_nested_values_rendered_as_json() {
        let mut params = Map::new();
        params.insert("attack_kwargs".to_string(), serde_json::json!({"eps": 0.5}));
        let record = ResultRecord::new(&params, None, None, None);
        let index = COLUMNS.iter().position(|c| *c == "attack_kwargs").unwrap();
        assert_eq!(record.cells()[index], r#"{"eps":0.5}"#);
    }
}
