//! Experiment lifecycle
//!
//! An experiment is resolved once into an immutable [`ExperimentState`], then
//! driven through its stages by a [`StageRunner`]. Every completed run appends
//! one [`ResultRecord`] to the experiment's shared log.
//!
//! ## Stage Overview
//!
//! ```text
//! NotStarted ─> Trained ─> Pruned ─> Quantized ─> Attacked ─> TransferAttacked ─> Evaluated ─> Logged
//! ```
//!
//! Any stage may be skipped; none may be revisited.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use prunelab::collaborator::{CommandBackend, Collaborators};
//! use prunelab::config::ExperimentConfig;
//! use prunelab::experiment::{ExperimentState, StageRunner};
//! use prunelab::path_codec::PathCodec;
//!
//! # fn main() -> prunelab::Result<()> {
//! let config = ExperimentConfig::builder(0, "CIFAR10", "VGG")
//!     .prune("L1", 4)
//!     .finetune_epochs(5)
//!     .build()?;
//! let state = ExperimentState::resolve(config, &PathCodec::new("/data"))?;
//!
//! let backend = CommandBackend::new(vec!["python".into(), "collaborator.py".into()]);
//! let outcome = StageRunner::new(&state, Collaborators::uniform(&backend)).run()?;
//! println!("{:?}", outcome.record.get("top1"));
//! # Ok(())
//! # }
//! ```

mod results;
mod runner;
mod stage;
mod state;

pub use results::{ResultLogger, ResultRecord, COLUMNS, NULL_SENTINEL};
pub use runner::{
    attack_params, default_attack_params, format_elapsed, RunOutcome, StageRunner,
    DEFAULT_ATTACK_METHOD,
};
pub use stage::{Stage, StageRecord};
pub use state::{ExperimentState, ENCODE_ERROR_SENTINEL, PARAMS_FILE_PREFIX};
