//! Status command - summarize the parameter table.

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;
use serde_json::json;
use sweep_core::row::format_timestamp;
use sweep_core::{Row, Status};
use sweep_dispatch::SweepSummary;

use crate::{Config, OutputFormat};

/// Arguments for the status command.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// List every row, not just the totals.
    #[arg(long, short = 'r')]
    pub rows: bool,
}

/// Execute the status command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the table
/// cannot be read.
pub async fn execute(args: StatusArgs, config: &Config) -> Result<()> {
    let sweep = config.load_sweep_config()?;
    let backend = sweep_dispatch::open(&sweep)
        .await
        .context("Failed to open parameter table")?;
    let rows = backend
        .read_all()
        .await
        .context("Failed to read parameter table")?;
    let summary = SweepSummary::from_rows(&rows);

    match config.format {
        OutputFormat::Json => {
            let mut body = json!({ "summary": summary });
            if args.rows {
                body["rows"] = serde_json::to_value(&rows).context("Failed to serialize rows")?;
            }
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        OutputFormat::Text => {
            print_summary(&summary);
            if args.rows {
                println!();
                for row in &rows {
                    println!("  {} {}", row.id, format_status_colored(&row.status));
                    if let Some(comment) = &row.comment {
                        println!("    {}", comment.dimmed());
                    }
                }
            }
        }
        OutputFormat::Table => {
            print_summary(&summary);
            if args.rows {
                println!();
                println!("{}", rows_table(&rows));
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &SweepSummary) {
    println!("Parameter table:");
    println!("  Total:       {}", summary.total);
    println!("  Pending:     {}", summary.pending);
    println!("  In progress: {}", summary.in_progress);
    for (label, count) in &summary.stages {
        println!("    {label}: {count}");
    }
    println!("  Succeeded:   {}", format!("{}", summary.success).green());
    if summary.failed > 0 {
        println!("  Failed:      {}", format!("{}", summary.failed).red());
    } else {
        println!("  Failed:      {}", summary.failed);
    }
}

fn rows_table(rows: &[Row]) -> String {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct RowLine {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Started")]
        started: String,
        #[tabled(rename = "Ended")]
        ended: String,
        #[tabled(rename = "By")]
        performed_by: String,
        #[tabled(rename = "Comment")]
        comment: String,
    }

    let lines: Vec<_> = rows
        .iter()
        .map(|row| RowLine {
            id: row.id.to_string(),
            status: row.status.to_string(),
            started: row.start_time.as_ref().map(format_timestamp).unwrap_or_default(),
            ended: row.end_time.as_ref().map(format_timestamp).unwrap_or_default(),
            performed_by: row.performed_by.clone().unwrap_or_default(),
            comment: row.comment.clone().unwrap_or_default(),
        })
        .collect();
    Table::new(lines).to_string()
}

fn format_status_colored(status: &Status) -> String {
    let text = status.to_string();
    match status {
        Status::Success => text.green().to_string(),
        Status::Failed => text.red().to_string(),
        Status::Claimed | Status::Stage(_) => text.blue().to_string(),
        Status::Pending => text.yellow().to_string(),
    }
}
