//! # prunelab: Experiment Orchestration for Model Compression Research
//!
//! prunelab sequences the train → prune → quantize → attack → evaluate → log
//! pipeline of a compression experiment. The numerical work is delegated to
//! external collaborators; this crate owns the parts that have to be exact:
//!
//! - **Experiment identity**: a configuration is encoded into a canonical
//!   directory path, and that path can be decoded back into the configuration
//!   it came from, which is what makes resuming safe.
//! - **Stage sequencing**: which stages run, in which order, and which
//!   combinations are legal.
//! - **Sweeps**: cross products of candidate parameter values.
//! - **Result logging**: one rectangular row per run in an append-only CSV.
//!
//! ## Directory layout
//!
//! ```text
//! <root>/
//!     datasets/<dataset>/
//!     experiments/
//!         experiment_<n>/
//!             experiment_<n>_logs.csv
//!             <model_type>/<dataset>/<folder_name>/
//!                 experiment_params_<timestamp>.json
//!                 attacks/<attack_method>/
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use prunelab::config::ExperimentConfig;
//! use prunelab::experiment::ExperimentState;
//! use prunelab::path_codec::PathCodec;
//!
//! let config = ExperimentConfig::builder(0, "CIFAR10", "VGG")
//!     .prune("L1", 4)
//!     .finetune_epochs(5)
//!     .build()?;
//!
//! let codec = PathCodec::new("/data/compression");
//! let state = ExperimentState::resolve(config, &codec)?;
//! assert_eq!(state.name(), "vgg_L1_4_compression_5_finetune_iterations");
//! # Ok::<(), prunelab::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod collaborator;
pub mod config;
pub mod error;
pub mod experiment;
pub mod notify;
pub mod path_codec;
pub mod sweep;

pub use error::{Error, Result};
