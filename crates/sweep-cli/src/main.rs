//! Sweep CLI - parameter-sweep worker.
//!
//! The main entry point for the `sweep` CLI binary.

use anyhow::Result;
use clap::Parser;

use sweep_cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    sweep_core::init_logging(cli.log_format.into());
    let config = cli.config();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => sweep_cli::commands::run::execute(args, &config).await,
            Commands::Status(args) => sweep_cli::commands::status::execute(args, &config).await,
        }
    })
}
