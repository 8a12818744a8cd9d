//! # sweep-cli
//!
//! Command-line interface for the sweep parameter dispatcher.
//!
//! ## Commands
//!
//! - `sweep run` - Claim rows and drive each through the configured pipeline
//!   until none remain
//! - `sweep status` - Summarize the parameter table
//!
//! ## Configuration
//!
//! - `SWEEP_CONFIG` - Path to the sweep configuration file (default: `sweep.json`)
//! - `SWEEP_LOG_FORMAT` - `pretty` or `json`
//! - `RUST_LOG` - Log filter (default: `info`)
//!
//! The configuration file itself honours the `SWEEP_*` overrides documented on
//! [`SweepConfig::load`](sweep_core::SweepConfig::load).

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;
pub mod pipeline;
pub mod render;
pub mod worker;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sweep_core::{LogFormat, SweepConfig};

/// Sweep CLI - parameter-sweep worker.
#[derive(Debug, Parser)]
#[command(name = "sweep")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the sweep configuration file.
    #[arg(long, short = 'c', env = "SWEEP_CONFIG", default_value = "sweep.json")]
    pub config: PathBuf,

    /// Log output format.
    #[arg(long, env = "SWEEP_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,

    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            config_path: self.config.clone(),
            format: self.format.clone(),
        }
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Claim rows and run the pipeline until none remain.
    Run(commands::run::RunArgs),
    /// Summarize the parameter table.
    Status(commands::status::StatusArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// Log format flag.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum LogFormatArg {
    /// Pretty-printed logs.
    #[default]
    Pretty,
    /// JSON structured logs.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// CLI configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Sweep configuration file.
    pub config_path: PathBuf,
    /// Output format.
    pub format: OutputFormat,
}

impl Config {
    /// Loads and validates the sweep configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed, or invalid.
    pub fn load_sweep_config(&self) -> Result<SweepConfig> {
        SweepConfig::load(&self.config_path).with_context(|| {
            format!(
                "Failed to load sweep configuration from {}",
                self.config_path.display()
            )
        })
    }
}
