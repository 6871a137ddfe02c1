//! Chest disease classifier pipeline.
//!
//! Runs data ingestion, base model preparation, training and evaluation in
//! order, or a single stage when a subcommand is given.

mod stages;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chest_core::{backend_name, setup_logging, ConfigurationManager, DEFAULT_LOG_FILE};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use stages::{run_stage, DATA_INGESTION, EVALUATION, PREPARE_BASE_MODEL, TRAINING};

#[derive(Parser, Debug)]
#[command(name = "pipeline")]
#[command(version = "0.1.0")]
#[command(about = "Fine-tune and evaluate a chest disease image classifier", long_about = None)]
struct Cli {
    /// Pipeline configuration (paths, data source, tracking URI)
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Hyperparameters
    #[arg(short, long, default_value = "params.yaml")]
    params: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Running log file
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Run every stage in order (default)
    Run,
    /// Download and extract the dataset
    Ingest,
    /// Build the base model and attach the classification head
    PrepareBaseModel,
    /// Fine-tune the prepared model
    Train,
    /// Score the trained model and publish the run
    Evaluate {
        /// Only write scores.json, do not contact the tracking store
        #[arg(long, default_value = "false")]
        skip_publish: bool,
    },
}

fn run(cli: &Cli) -> Result<()> {
    let manager = ConfigurationManager::new(&cli.config, &cli.params).with_context(|| {
        format!(
            "loading {} and {}",
            cli.config.display(),
            cli.params.display()
        )
    })?;
    info!("Backend: {}", backend_name());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            run_stage(DATA_INGESTION, || stages::data_ingestion(&manager))?;
            run_stage(PREPARE_BASE_MODEL, || stages::prepare_base_model(&manager))?;
            run_stage(TRAINING, || stages::training(&manager))?;
            run_stage(EVALUATION, || stages::evaluation(&manager, true))?;
        }
        Commands::Ingest => run_stage(DATA_INGESTION, || stages::data_ingestion(&manager))?,
        Commands::PrepareBaseModel => {
            run_stage(PREPARE_BASE_MODEL, || stages::prepare_base_model(&manager))?
        }
        Commands::Train => run_stage(TRAINING, || stages::training(&manager))?,
        Commands::Evaluate { skip_publish } => {
            run_stage(EVALUATION, || stages::evaluation(&manager, !skip_publish))?
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = setup_logging(cli.verbose, Some(&cli.log_file)) {
        eprintln!("Error: {err}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
