//! prunelab command-line interface

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use prunelab::collaborator::{CommandBackend, Collaborators};
use prunelab::config::{ExperimentConfig, LogSettings, Settings};
use prunelab::experiment::{ExperimentState, StageRunner};
use prunelab::notify::{self, Notifier};
use prunelab::path_codec::{infer_from_path, PathCodec, PathFragment};
use prunelab::sweep::SweepFile;

/// Experiment orchestration for model compression research
#[derive(Parser, Debug)]
#[command(name = "prunelab", version, about)]
struct Cli {
    /// Experiment root (defaults to the `root` setting, then the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Additional settings file, layered over `<root>/prunelab.toml`
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve and run one experiment
    Run {
        /// Experiment configuration (TOML or JSON)
        config: PathBuf,
    },
    /// Run every combination of a sweep, one after another
    Sweep {
        /// Sweep description (TOML or JSON)
        file: PathBuf,
        /// Print the folder names without running anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the folder name and directory a configuration encodes to
    Encode {
        /// Experiment configuration (TOML or JSON)
        config: PathBuf,
    },
    /// Print the configuration fields captured by an artifact path
    Decode {
        /// Path inside an experiment directory
        path: PathBuf,
    },
}

fn init_tracing(cli: &Cli, log: &LogSettings) {
    let directive = match cli.verbose {
        0 if cli.quiet => "error".to_string(),
        0 => log.filter.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = || {
        if cli.verbose == 0 && !cli.quiet {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive))
        } else {
            EnvFilter::new(&directive)
        }
    };

    let stderr_layer = (!log.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter())
    });
    let json_layer = log.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let root = cli.root.clone().unwrap_or_else(|| PathBuf::from("."));
    let settings = Settings::load(&root, cli.settings.as_deref())?;
    init_tracing(&cli, &settings.log);

    // An explicit --root beats the one from settings.
    let root = cli.root.clone().unwrap_or_else(|| settings.root.clone());
    let codec = PathCodec::new(root).with_data_root_env(settings.data_root_env.clone());

    match &cli.command {
        Command::Run { config } => {
            let config = ExperimentConfig::from_file(config)?;
            run_one(config, &codec, &settings)
        }
        Command::Sweep { file, dry_run } => sweep(file, *dry_run, &codec, &settings),
        Command::Encode { config } => {
            let config = ExperimentConfig::from_file(config)?;
            let (paths, folder) = codec.plan(&config)?;
            println!("{folder}");
            println!("{}", paths.model.display());
            Ok(())
        }
        Command::Decode { path } => {
            let inference = infer_from_path(path, &PathFragment::default())?;
            let report = json!({
                "fragment": inference.fragment,
                "already_pruned": inference.already_pruned,
                "already_quantized": inference.already_quantized,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn run_one(config: ExperimentConfig, codec: &PathCodec, settings: &Settings) -> anyhow::Result<()> {
    let state = ExperimentState::resolve(config, codec)?;
    let backend = CommandBackend::new(settings.backend.command.clone());
    let notifier: Box<dyn Notifier> = notify::from_settings(&settings.notify);

    let outcome = StageRunner::new(&state, Collaborators::uniform(&backend))
        .with_notifier(notifier.as_ref(), settings.notify.verbose)
        .run()
        .with_context(|| format!("experiment `{}` failed", state.name()))?;

    let stages: Vec<&str> = outcome.history.iter().map(|r| r.stage.as_str()).collect();
    info!(
        name = state.name(),
        stages = ?stages,
        model_path = ?outcome.model_path,
        log = %state.paths().logs.display(),
        "Run complete"
    );
    Ok(())
}

fn sweep(file: &Path, dry_run: bool, codec: &PathCodec, settings: &Settings) -> anyhow::Result<()> {
    let sweep = SweepFile::from_file(file)?;
    let configs = sweep.configs()?;
    info!(combinations = configs.len(), file = %file.display(), "Expanded sweep");

    if dry_run {
        for config in &configs {
            let (_, folder) = codec.plan(config)?;
            println!("{folder}");
        }
        return Ok(());
    }

    let total = configs.len();
    let mut failed = 0usize;
    for (index, config) in configs.into_iter().enumerate() {
        info!(index = index + 1, total, "Starting sweep combination");
        if let Err(e) = run_one(config, codec, settings) {
            failed += 1;
            error!(index = index + 1, error = %format!("{e:#}"), "Sweep combination failed");
        }
    }
    if failed > 0 {
        bail!("{failed} of {total} sweep combinations failed");
    }
    Ok(())
}
