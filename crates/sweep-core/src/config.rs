//! Process-wide sweep configuration.
//!
//! Loaded once at startup from a JSON file, optionally overridden from
//! `SWEEP_*` environment variables, validated, and then passed explicitly to
//! whatever needs it. Nothing mutates it afterwards.
//!
//! ```json
//! {
//!   "backend": { "kind": "delimited_file", "path": "parameters.csv" },
//!   "defaults": { "save.folder": "output" },
//!   "performed_by": "node-1",
//!   "pipeline": {
//!     "stages": [
//!       { "kind": "command", "label": "clean", "program": "make", "args": ["data-cleanup"] },
//!       { "kind": "render", "label": "configure", "template": "config/PhysiCell_settings_default.xml", "output": "config/PhysiCell_settings.xml" },
//!       { "kind": "command", "label": "sim", "program": "./biorobots", "windows_program": "biorobots.exe" }
//!     ]
//!   }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::overlay::ParameterMap;

/// Top-level sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Which table backend to use and how to reach it.
    pub backend: BackendConfig,

    /// Global defaults overlaid beneath every claimed row's parameters.
    #[serde(default)]
    pub defaults: ParameterMap,

    /// Retry policy for transient backend failures.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Optimistic claim policy for backends without native locking.
    #[serde(default)]
    pub claim: ClaimPolicy,

    /// Worker loop behaviour.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Stages each claimed row is driven through.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Identity recorded in the `performed-by` column on claim.
    #[serde(default)]
    pub performed_by: Option<String>,

    /// Maximum number of rows one coordinator will claim.
    #[serde(default)]
    pub max_runs: Option<u32>,

    /// Strength of this worker, compared with `required-computer-strength`.
    #[serde(default)]
    pub computer_strength: Option<f64>,
}

/// Table backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Delimited text file on a local or network filesystem.
    DelimitedFile {
        /// Path to the table.
        path: PathBuf,
        /// Field delimiter.
        #[serde(default = "default_delimiter")]
        delimiter: char,
        /// How long to wait for the table lock before giving up.
        #[serde(default = "default_lock_timeout_ms")]
        lock_timeout_ms: u64,
    },
    /// Remote collaborative spreadsheet.
    Sheets {
        /// Spreadsheet identifier.
        spreadsheet_id: String,
        /// Service-account key file. Application default credentials are
        /// used when absent.
        #[serde(default)]
        credentials_path: Option<PathBuf>,
        /// Worksheet title; the first worksheet when absent.
        #[serde(default)]
        worksheet: Option<String>,
        /// API base URL.
        #[serde(default = "default_sheets_api_base")]
        api_base: String,
    },
}

fn default_delimiter() -> char {
    ','
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_sheets_api_base() -> String {
    "https://sheets.googleapis.com/v4".to_string()
}

impl BackendConfig {
    /// Returns a short backend name for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DelimitedFile { .. } => "delimited_file",
            Self::Sheets { .. } => "sheets",
        }
    }
}

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_backoff_ms: u64,
    /// Upper bound for a single delay.
    pub max_backoff_ms: u64,
    /// Timeout for each individual network call.
    pub request_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let millis = self
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(exponent))
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Optimistic claim policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimPolicy {
    /// Conflicting claim attempts tolerated before reporting contention.
    pub max_contention_retries: u32,
    /// Pause between writing a claim and verifying it survived.
    pub verify_delay_ms: u64,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_contention_retries: 5,
            verify_delay_ms: 250,
        }
    }
}

impl ClaimPolicy {
    /// Pause between writing a claim and verifying it.
    #[must_use]
    pub const fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }
}

/// Worker loop behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pause after a failed claim attempt before trying again.
    pub retreat_ms: u64,
    /// Consecutive failed claim attempts tolerated before the worker exits.
    pub max_consecutive_errors: u32,
    /// Where the merged parameters are written as JSON before the stages run.
    pub params_file: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retreat_ms: 5_000,
            max_consecutive_errors: 5,
            params_file: None,
        }
    }
}

impl WorkerConfig {
    /// Pause after a failed claim attempt.
    #[must_use]
    pub const fn retreat(&self) -> Duration {
        Duration::from_millis(self.retreat_ms)
    }
}

/// Ordered pipeline of stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages, run in order for every claimed row.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    /// Runs an external program and waits for it.
    Command {
        /// Status label recorded before the stage runs.
        label: String,
        /// Program to execute.
        program: String,
        /// Program to execute instead on Windows.
        #[serde(default)]
        windows_program: Option<String>,
        /// Arguments; `{id}` is replaced with the row id.
        #[serde(default)]
        args: Vec<String>,
        /// Working directory for the program.
        #[serde(default)]
        working_dir: Option<PathBuf>,
        /// Kill the program after this many seconds.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Writes the merged parameters into a JSON or XML configuration
    /// template.
    Render {
        /// Status label recorded before the stage runs.
        label: String,
        /// Template document.
        template: PathBuf,
        /// Rendered document; `{id}` is replaced with the row id.
        output: String,
        /// Key-paths never written even when present.
        #[serde(default)]
        exclude: Vec<String>,
        /// Template format; inferred from the template extension if unset.
        #[serde(default)]
        format: Option<TemplateFormat>,
    },
}

/// Document format of a render template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFormat {
    /// Nested JSON objects and arrays.
    Json,
    /// XML elements addressed below the root element.
    Xml,
}

impl TemplateFormat {
    /// Infers the format from a template path: `.xml` is XML, anything else
    /// is JSON.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("xml") => Self::Xml,
            _ => Self::Json,
        }
    }
}

impl StageConfig {
    /// Returns the status label recorded for this stage.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Command { label, .. } | Self::Render { label, .. } => label,
        }
    }
}

impl SweepConfig {
    /// Creates a configuration for the given backend with every other
    /// section at its default.
    #[must_use]
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            defaults: ParameterMap::new(),
            retry: RetryPolicy::default(),
            claim: ClaimPolicy::default(),
            worker: WorkerConfig::default(),
            pipeline: PipelineConfig::default(),
            performed_by: None,
            max_runs: None,
            computer_strength: None,
        }
    }

    /// Loads, overrides from the environment, and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the file cannot be read or parsed, an
    /// environment override is malformed, or validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_json(&raw)?;
        config.apply_overrides(env_string)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration document without validating it.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the document is not valid JSON for this schema.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::configuration(format!("failed to parse config: {e}")))
    }

    /// Applies `SWEEP_*` overrides obtained through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if an override has the wrong type or does not
    /// apply to the selected backend.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SWEEP_TABLE_PATH") {
            match &mut self.backend {
                BackendConfig::DelimitedFile { path, .. } => *path = PathBuf::from(value),
                BackendConfig::Sheets { .. } => {
                    return Err(Error::configuration(
                        "SWEEP_TABLE_PATH requires the delimited_file backend",
                    ));
                }
            }
        }
        if let Some(value) = lookup("SWEEP_SPREADSHEET_ID") {
            match &mut self.backend {
                BackendConfig::Sheets { spreadsheet_id, .. } => *spreadsheet_id = value,
                BackendConfig::DelimitedFile { .. } => {
                    return Err(Error::configuration(
                        "SWEEP_SPREADSHEET_ID requires the sheets backend",
                    ));
                }
            }
        }
        if let Some(value) = lookup("SWEEP_CREDENTIALS_PATH") {
            if let BackendConfig::Sheets {
                credentials_path, ..
            } = &mut self.backend
            {
                *credentials_path = Some(PathBuf::from(value));
            }
        }
        if let Some(value) = lookup("SWEEP_PERFORMED_BY") {
            self.performed_by = Some(value);
        }
        if let Some(value) = lookup("SWEEP_MAX_RUNS") {
            let parsed = value.parse::<u32>().map_err(|e| {
                Error::configuration(format!("SWEEP_MAX_RUNS must be a u32: {e}"))
            })?;
            self.max_runs = Some(parsed);
        }
        Ok(())
    }

    /// Checks invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        match &self.backend {
            BackendConfig::DelimitedFile {
                path, delimiter, ..
            } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::configuration("backend.path must not be empty"));
                }
                if !delimiter.is_ascii() || matches!(delimiter, '"' | '\n' | '\r') {
                    return Err(Error::configuration(format!(
                        "backend.delimiter must be a single ASCII character other than a quote or newline (got {delimiter:?})"
                    )));
                }
            }
            BackendConfig::Sheets {
                spreadsheet_id,
                api_base,
                ..
            } => {
                if spreadsheet_id.trim().is_empty() {
                    return Err(Error::configuration(
                        "backend.spreadsheet_id must not be empty",
                    ));
                }
                if !(api_base.starts_with("https://") || api_base.starts_with("http://")) {
                    return Err(Error::configuration(
                        "backend.api_base must be an http(s) URL",
                    ));
                }
            }
        }

        if let Some((key, _)) = self
            .defaults
            .iter()
            .find(|(_, value)| matches!(value, Value::Array(_) | Value::Object(_)))
        {
            return Err(Error::configuration(format!(
                "defaults.{key} must be a scalar value"
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::configuration("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::configuration(
                "retry.base_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        if self.retry.request_timeout_ms == 0 {
            return Err(Error::configuration(
                "retry.request_timeout_ms must be positive",
            ));
        }
        if self.claim.max_contention_retries == 0 {
            return Err(Error::configuration(
                "claim.max_contention_retries must be at least 1",
            ));
        }
        if self.max_runs == Some(0) {
            return Err(Error::configuration("max_runs must be at least 1 when set"));
        }
        if let Some(strength) = self.computer_strength {
            if !strength.is_finite() {
                return Err(Error::configuration("computer_strength must be finite"));
            }
        }

        for stage in &self.pipeline.stages {
            crate::status::Status::stage(stage.label()).map_err(|e| {
                Error::configuration(format!("pipeline stage label is invalid: {e}"))
            })?;
            if let StageConfig::Command { program, .. } = stage {
                if program.trim().is_empty() {
                    return Err(Error::configuration(format!(
                        "pipeline stage '{}' has an empty program",
                        stage.label()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_format_follows_extension_unless_set() {
        assert_eq!(
            TemplateFormat::from_path(Path::new("PhysiCell_settings_default.XML")),
            TemplateFormat::Xml
        );
        assert_eq!(TemplateFormat::from_path(Path::new("default.json")), TemplateFormat::Json);

        let stage: StageConfig = serde_json::from_str(
            r#"{ "kind": "render", "label": "configure", "template": "t.cfg", "output": "o.cfg", "format": "xml" }"#,
        )
        .unwrap();
        assert!(matches!(
            stage,
            StageConfig::Render { format: Some(TemplateFormat::Xml), .. }
        ));
    }
    use serde_json::json;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"{ "backend": { "kind": "delimited_file", "path": "parameters.csv" } }"#;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = SweepConfig::from_json(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(
            config.backend,
            BackendConfig::DelimitedFile {
                path: PathBuf::from("parameters.csv"),
                delimiter: ',',
                lock_timeout_ms: 30_000,
            }
        );
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.claim.max_contention_retries, 5);
        assert!(config.pipeline.stages.is_empty());
        assert!(config.max_runs.is_none());
    }

    #[test]
    fn sheets_backend_with_pipeline() {
        let raw = r#"{
            "backend": { "kind": "sheets", "spreadsheet_id": "abc123", "worksheet": "runs" },
            "defaults": { "overall.max_time": 2880, "save.folder": "output" },
            "performed_by": "node-7",
            "max_runs": 3,
            "pipeline": { "stages": [
                { "kind": "command", "label": "clean", "program": "make", "args": ["data-cleanup"] },
                { "kind": "render", "label": "xml", "template": "default.json", "output": "out/{id}.json", "exclude": ["save.folder"] }
            ] }
        }"#;

        let config = SweepConfig::from_json(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.backend.kind(), "sheets");
        assert_eq!(config.defaults["overall.max_time"], json!(2880));
        assert_eq!(config.pipeline.stages.len(), 2);
        assert_eq!(config.pipeline.stages[1].label(), "xml");
        assert_eq!(config.max_runs, Some(3));
    }

    #[test]
    fn overrides_apply_to_matching_backend() {
        let mut config = SweepConfig::from_json(MINIMAL).unwrap();
        config
            .apply_overrides(lookup_from(&[
                ("SWEEP_TABLE_PATH", "/shared/params.csv"),
                ("SWEEP_PERFORMED_BY", "hpc-12"),
                ("SWEEP_MAX_RUNS", "4"),
            ]))
            .unwrap();

        assert!(matches!(
            &config.backend,
            BackendConfig::DelimitedFile { path, .. } if path == Path::new("/shared/params.csv")
        ));
        assert_eq!(config.performed_by.as_deref(), Some("hpc-12"));
        assert_eq!(config.max_runs, Some(4));
    }

    #[test]
    fn mismatched_override_is_rejected() {
        let mut config = SweepConfig::from_json(MINIMAL).unwrap();
        let err = config
            .apply_overrides(lookup_from(&[("SWEEP_SPREADSHEET_ID", "abc")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        let err = config
            .apply_overrides(lookup_from(&[("SWEEP_MAX_RUNS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("SWEEP_MAX_RUNS"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = SweepConfig::from_json(MINIMAL).unwrap();
        config.defaults.insert("nested".into(), json!({ "a": 1 }));
        assert!(config.validate().is_err());

        let mut config = SweepConfig::from_json(MINIMAL).unwrap();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = SweepConfig::from_json(MINIMAL).unwrap();
        config.pipeline.stages.push(StageConfig::Command {
            label: "success".into(),
            program: "true".into(),
            windows_program: None,
            args: vec![],
            working_dir: None,
            timeout_secs: None,
        });
        assert!(config.validate().is_err());

        let config = SweepConfig::new(BackendConfig::Sheets {
            spreadsheet_id: " ".into(),
            credentials_path: None,
            worksheet: None,
            api_base: default_sheets_api_base(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            request_timeout_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = SweepConfig::load(&path).unwrap();
        assert_eq!(config.backend.kind(), "delimited_file");

        let missing = SweepConfig::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, Error::Configuration { .. }));
    }
}
