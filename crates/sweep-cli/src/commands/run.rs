//! Run command - claim rows and drive them through the pipeline.

use anyhow::{Context, Result};
use clap::Args;
use sweep_core::SweepConfig;
use sweep_core::observability::worker_span;
use sweep_dispatch::ParamCoordinator;
use tracing::Instrument;

use crate::worker::{Worker, WorkerReport};
use crate::{Config, OutputFormat};

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Stop after claiming this many rows.
    #[arg(long)]
    pub max_runs: Option<u32>,

    /// Identity recorded in the `performed-by` column.
    #[arg(long)]
    pub performed_by: Option<String>,

    /// Strength compared with `required-computer-strength`.
    #[arg(long)]
    pub computer_strength: Option<f64>,
}

impl RunArgs {
    /// Applies command-line overrides on top of the loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn apply(&self, config: &mut SweepConfig) -> Result<()> {
        if let Some(max_runs) = self.max_runs {
            config.max_runs = Some(max_runs);
        }
        if let Some(who) = &self.performed_by {
            config.performed_by = Some(who.clone());
        }
        if let Some(strength) = self.computer_strength {
            config.computer_strength = Some(strength);
        }
        config.validate().context("Invalid command-line overrides")?;
        Ok(())
    }
}

/// Execute the run command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the backend cannot
/// be opened, or the worker gives up on claims.
pub async fn execute(args: RunArgs, config: &Config) -> Result<()> {
    let mut sweep = config.load_sweep_config()?;
    args.apply(&mut sweep)?;

    let report = run_sweep(&sweep).await?;

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialize report")?
            );
        }
        OutputFormat::Text | OutputFormat::Table => {
            println!("Sweep finished.");
            println!();
            println!("  Succeeded: {}", report.succeeded);
            println!("  Failed:    {}", report.failed);
            if report.abandoned > 0 {
                println!("  Abandoned: {}", report.abandoned);
            }
            if report.retreats > 0 {
                println!("  Retreats:  {}", report.retreats);
            }
        }
    }
    Ok(())
}

/// Opens the backend and runs a worker until no rows remain.
///
/// # Errors
///
/// Returns an error if the backend cannot be opened or the worker stops on
/// a backend error.
pub async fn run_sweep(sweep: &SweepConfig) -> Result<WorkerReport> {
    sweep_dispatch::metrics::register_metrics();

    let backend = sweep_dispatch::open(sweep)
        .await
        .context("Failed to open parameter table")?;
    let worker_name = sweep.performed_by.clone().unwrap_or_else(|| "anonymous".into());
    let span = worker_span(&worker_name, backend.kind());

    let coordinator = ParamCoordinator::from_config(backend, sweep);
    let worker = Worker::new(coordinator, sweep.pipeline.clone(), sweep.worker.clone());

    async {
        tracing::info!(stages = sweep.pipeline.stages.len(), "sweep started");
        worker.run().await.context("Worker stopped")
    }
    .instrument(span)
    .await
}
