//! Error types for prunelab
//!
//! Configuration-class errors name the offending field and the evidence that
//! contradicts it, so an invocation can be fixed without reading the source.

use std::path::PathBuf;

use thiserror::Error;

use crate::experiment::Stage;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// prunelab error types
#[derive(Error, Debug)]
pub enum Error {
    /// Illegal field value or field combination, detected before any work starts
    #[error("Configuration error in `{field}`: {reason}")]
    Configuration {
        /// Offending configuration field
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// A resumed run supplied a value that contradicts the on-disk identity
    #[error(
        "Configuration conflict in `{field}`: supplied {supplied}, but {} encodes {found}\nDrop the explicit value or resume from a matching path.",
        path.display()
    )]
    ResumeConflict {
        /// Conflicting configuration field
        field: String,
        /// Value passed by the caller
        supplied: String,
        /// Value decoded from the path (`<absent>` when the path carries none)
        found: String,
        /// Path the value was decoded from
        path: PathBuf,
    },

    /// A stage was requested without what it needs to run
    #[error("Precondition failed for `{stage}`: {reason}")]
    Precondition {
        /// Stage that could not run
        stage: Stage,
        /// Missing prerequisite
        reason: String,
    },

    /// The runner was asked to move between stages in an order it does not allow
    #[error("Illegal stage transition: {from} -> {to}")]
    IllegalTransition {
        /// Current stage
        from: Stage,
        /// Requested stage
        to: Stage,
    },

    /// An external collaborator (trainer, pruner, attacker, ...) failed
    #[error("Collaborator failed during `{stage}`: {source}")]
    Collaborator {
        /// Stage whose collaborator failed
        stage: Stage,
        /// Error as reported by the collaborator
        source: anyhow::Error,
    },

    /// Runner settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// Build a [`Error::Configuration`] for `field`.
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`Error::Precondition`] for `stage`.
    pub fn precondition(stage: Stage, reason: impl Into<String>) -> Self {
        Self::Precondition {
            stage,
            reason: reason.into(),
        }
    }

    /// True for failures caused by the invocation rather than by a collaborator or the
    /// filesystem. These are always raised before any collaborator runs.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::ResumeConflict { .. } | Self::Precondition { .. }
        )
    }
}
