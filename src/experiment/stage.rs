//! Stage state machine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage reached by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Nothing has run yet.
    NotStarted,
    /// A model was trained from scratch.
    Trained,
    /// The model was pruned and finetuned.
    Pruned,
    /// The model was quantized.
    Quantized,
    /// The model was attacked directly.
    Attacked,
    /// The model was attacked with transferred examples.
    TransferAttacked,
    /// The final model was evaluated.
    Evaluated,
    /// The result row was appended. Terminal.
    Logged,
}

impl Stage {
    /// Whether a run may move from `self` to `next`.
    ///
    /// Transformations only move forward (train, prune, quantize). An attack may
    /// follow any of them or start the run; the transfer attack and evaluation may
    /// follow anything before them, and logging only follows evaluation.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use Stage::{
            Attacked, Evaluated, Logged, NotStarted, Pruned, Quantized, TransferAttacked, Trained,
        };
        matches!(
            (self, next),
            (NotStarted, Trained)
                | (NotStarted | Trained, Pruned)
                | (NotStarted | Trained | Pruned, Quantized)
                | (NotStarted | Trained | Pruned | Quantized, Attacked)
                | (
                    NotStarted | Trained | Pruned | Quantized | Attacked,
                    TransferAttacked
                )
                | (
                    NotStarted | Trained | Pruned | Quantized | Attacked | TransferAttacked,
                    Evaluated
                )
                | (Evaluated, Logged)
        )
    }

    /// True for the final stage.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Logged)
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Trained => "trained",
            Self::Pruned => "pruned",
            Self::Quantized => "quantized",
            Self::Attacked => "attacked",
            Self::TransferAttacked => "transfer_attacked",
            Self::Evaluated => "evaluated",
            Self::Logged => "logged",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage the run completed, with its wall-clock span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage reached.
    pub stage: Stage,
    /// When work for the stage began.
    pub started_at: DateTime<Utc>,
    /// When the stage was reached.
    pub ended_at: DateTime<Utc>,
}
