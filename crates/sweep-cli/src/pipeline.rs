//! Pipeline stages run for every claimed row.
//!
//! A stage either runs an external program to completion or renders the
//! merged parameters into a configuration template. Each stage yields a
//! [`StageOutcome`]; the worker decides what a failed outcome means.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sweep_core::Claim;
use sweep_core::config::{StageConfig, TemplateFormat};

use crate::render::render_template;

/// Environment variable carrying the claimed row id.
pub const ROW_ID_ENV: &str = "SWEEP_ROW_ID";

/// Environment variable carrying the path of the parameters file.
pub const PARAMS_FILE_ENV: &str = "SWEEP_PARAMS_FILE";

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    /// Exit code; `None` if the process was killed or the stage ran in-process.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the stage.
    pub duration: Duration,
    /// Whether the stage finished without error.
    pub success: bool,
    /// Why the stage failed, if it did.
    pub detail: Option<String>,
}

impl StageOutcome {
    fn succeeded(exit_code: Option<i32>, duration: Duration) -> Self {
        Self {
            exit_code,
            duration,
            success: true,
            detail: None,
        }
    }

    fn failed(exit_code: Option<i32>, duration: Duration, detail: String) -> Self {
        Self {
            exit_code,
            duration,
            success: false,
            detail: Some(detail),
        }
    }
}

/// Per-row inputs to a stage.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    /// The claimed row and its merged parameters.
    pub claim: &'a Claim,
    /// Where the merged parameters were written, if anywhere.
    pub params_file: Option<&'a Path>,
}

/// Replaces `{id}` with the row id.
#[must_use]
pub fn substitute(template: &str, id: &str) -> String {
    template.replace("{id}", id)
}

/// Picks the program for the current platform.
#[must_use]
pub fn platform_program<'a>(program: &'a str, windows_program: Option<&'a str>) -> &'a str {
    if cfg!(windows) {
        windows_program.unwrap_or(program)
    } else {
        program
    }
}

/// Runs one stage.
///
/// A program that cannot be started, exits non-zero, or times out yields a
/// failed outcome rather than an error, as does a template that cannot be
/// rendered.
pub async fn run_stage(stage: &StageConfig, ctx: StageContext<'_>) -> StageOutcome {
    let started = Instant::now();
    match stage {
        StageConfig::Command {
            program,
            windows_program,
            args,
            working_dir,
            timeout_secs,
            ..
        } => {
            let program = platform_program(program, windows_program.as_deref());
            let timeout = timeout_secs.map(Duration::from_secs);
            run_command(program, args, working_dir.as_deref(), timeout, ctx, started).await
        }
        StageConfig::Render {
            template,
            output,
            exclude,
            format,
            ..
        } => {
            let output = PathBuf::from(substitute(output, ctx.claim.id.as_str()));
            let format = format.unwrap_or_else(|| TemplateFormat::from_path(template));
            match render_template(template, &output, format, &ctx.claim.parameters, exclude) {
                Ok(written) => {
                    tracing::debug!(written, output = %output.display(), "rendered configuration");
                    StageOutcome::succeeded(None, started.elapsed())
                }
                Err(e) => StageOutcome::failed(None, started.elapsed(), format!("{e:#}")),
            }
        }
    }
}

async fn run_command(
    program: &str,
    args: &[String],
    working_dir: Option<&Path>,
    timeout: Option<Duration>,
    ctx: StageContext<'_>,
    started: Instant,
) -> StageOutcome {
    let id = ctx.claim.id.as_str();
    let mut command = tokio::process::Command::new(program);
    command
        .args(args.iter().map(|arg| substitute(arg, id)))
        .env(ROW_ID_ENV, id)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(path) = ctx.params_file {
        command.env(PARAMS_FILE_ENV, path);
    }
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return StageOutcome::failed(
                None,
                started.elapsed(),
                format!("failed to start {program}: {e}"),
            );
        }
    };

    let waited = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(waited) => waited,
            Err(_) => {
                child.kill().await.ok();
                return StageOutcome::failed(
                    None,
                    started.elapsed(),
                    format!("{program} timed out after {}s", limit.as_secs()),
                );
            }
        },
        None => child.wait().await,
    };

    match waited {
        Ok(status) if status.success() => StageOutcome::succeeded(status.code(), started.elapsed()),
        Ok(status) => StageOutcome::failed(
            status.code(),
            started.elapsed(),
            format!("{program} exited with {status}"),
        ),
        Err(e) => StageOutcome::failed(
            None,
            started.elapsed(),
            format!("failed waiting for {program}: {e}"),
        ),
    }
}

/// Writes the merged parameters as JSON for stages to read.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_params_file(path: &Path, claim: &Claim) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(claim).context("Failed to serialize parameters")?;
    std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))
}
