//! Run configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables (usually sourced from a dotenv file), then command
//! line flags. Credentials are only ever read from the environment.

use crate::client::{Auth, DEFAULT_URL, PowerBiConnector};
use crate::etl::{
    DEFAULT_TOLERANCE_PERCENT, ExportFormat, FailedPeriodPolicy, IterationOrder, MAX_WINDOW_SIZE,
    RetryPolicy, Timeouts,
};
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub url: String,
    pub dataset: Option<String>,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub max_command_timeout_secs: u64,
    pub timeout_growth: f64,
    pub max_attempts: u32,
    pub backoff_secs: u64,
    pub memory_cooldown_secs: u64,
    pub window_size: usize,
    pub query_path: PathBuf,
    pub validation_query_path: Option<PathBuf>,
    pub amount_column: Option<String>,
    /// Largest accepted gap between extracted and expected totals, in percent
    pub validation_tolerance_percent: f64,
    pub output_dir: PathBuf,
    pub state_file: PathBuf,
    pub dataset_label: String,
    pub formats: Vec<ExportFormat>,
    pub failed_policy: FailedPeriodPolicy,
    pub order: IterationOrder,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            dataset: None,
            connect_timeout_secs: 30,
            command_timeout_secs: 600,
            max_command_timeout_secs: 3600,
            timeout_growth: 2.0,
            max_attempts: 5,
            backoff_secs: 30,
            memory_cooldown_secs: 60,
            window_size: 12,
            query_path: PathBuf::from("queries/extract_query.dax"),
            validation_query_path: None,
            amount_column: None,
            validation_tolerance_percent: DEFAULT_TOLERANCE_PERCENT,
            output_dir: PathBuf::from("exported_data"),
            state_file: PathBuf::from("retry_state.json"),
            dataset_label: "extract".to_string(),
            formats: vec![ExportFormat::Csv, ExportFormat::Parquet],
            failed_policy: FailedPeriodPolicy::default(),
            order: IterationOrder::default(),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| eyre!("Invalid {}='{}': {}", key, value, e))
}

impl Settings {
    /// Defaults, then `config` if given, then the process environment
    pub fn load(config: Option<&Path>) -> Result<Self> {
        match config {
            Some(path) => Self::read(path)?.apply_lookup(|key| std::env::var(key).ok()),
            None => Self::from_env(),
        }
    }

    /// Read settings from a YAML file; missing keys keep their defaults
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let settings: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(settings)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` resolves
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Self::default().apply_lookup(lookup)
    }

    /// Override fields with whichever variables `lookup` resolves
    pub fn apply_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("POWERBI_URL") {
            self.url = v;
        }
        if let Some(v) = get("POWERBI_DATASET") {
            self.dataset = Some(v);
        }
        if let Some(v) = get("CONNECT_TIMEOUT") {
            self.connect_timeout_secs = parse("CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("COMMAND_TIMEOUT") {
            self.command_timeout_secs = parse("COMMAND_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MAX_COMMAND_TIMEOUT") {
            self.max_command_timeout_secs = parse("MAX_COMMAND_TIMEOUT", &v)?;
        }
        if let Some(v) = get("TIMEOUT_GROWTH") {
            self.timeout_growth = parse("TIMEOUT_GROWTH", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.max_attempts = parse("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF") {
            self.backoff_secs = parse("RETRY_BACKOFF", &v)?;
        }
        if let Some(v) = get("MEMORY_COOLDOWN") {
            self.memory_cooldown_secs = parse("MEMORY_COOLDOWN", &v)?;
        }
        if let Some(v) = get("WINDOW_SIZE") {
            self.window_size = parse("WINDOW_SIZE", &v)?;
        }
        if let Some(v) = get("QUERY_PATH") {
            self.query_path = PathBuf::from(v);
        }
        if let Some(v) = get("VALIDATION_QUERY_PATH") {
            self.validation_query_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("AMOUNT_COLUMN") {
            self.amount_column = Some(v);
        }
        if let Some(v) = get("VALIDATION_TOLERANCE") {
            self.validation_tolerance_percent = parse("VALIDATION_TOLERANCE", &v)?;
        }
        if let Some(v) = get("OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("STATE_FILE") {
            self.state_file = PathBuf::from(v);
        }
        if let Some(v) = get("DATASET_LABEL") {
            self.dataset_label = v;
        }
        if let Some(v) = get("EXPORT_FORMATS") {
            self.formats = ExportFormat::parse_list(&v).context("Invalid EXPORT_FORMATS")?;
        }
        if let Some(v) = get("FAILED_PERIOD_POLICY") {
            self.failed_policy = parse("FAILED_PERIOD_POLICY", &v)?;
        }
        if let Some(v) = get("ITERATION_ORDER") {
            self.order = parse("ITERATION_ORDER", &v)?;
        }

        Ok(self)
    }

    /// Reject settings that cannot produce a working run
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            eyre::bail!("max_attempts must be at least 1");
        }
        if !(self.timeout_growth.is_finite() && self.timeout_growth >= 1.0) {
            eyre::bail!("timeout_growth must be at least 1.0, got {}", self.timeout_growth);
        }
        if !(1..=MAX_WINDOW_SIZE).contains(&self.window_size) {
            eyre::bail!(
                "window_size must be between 1 and {}, got {}",
                MAX_WINDOW_SIZE,
                self.window_size
            );
        }
        let tolerance = self.validation_tolerance_percent;
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            eyre::bail!(
                "validation_tolerance_percent must be a non-negative number, got {}",
                tolerance
            );
        }
        if self.formats.is_empty() {
            eyre::bail!("At least one export format is required");
        }
        if self.dataset_label.trim().is_empty() {
            eyre::bail!("dataset_label must not be empty");
        }
        if self.validation_query_path.is_some() != self.amount_column.is_some() {
            log::warn!(
                "Validation needs both VALIDATION_QUERY_PATH and AMOUNT_COLUMN, it will be skipped"
            );
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::new(
            Duration::from_secs(self.connect_timeout_secs),
            Duration::from_secs(self.command_timeout_secs),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_secs(self.backoff_secs),
            memory_cooldown: Duration::from_secs(self.memory_cooldown_secs),
            timeout_growth: self.timeout_growth,
            max_command_timeout: Duration::from_secs(self.max_command_timeout_secs),
        }
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.output_dir.join("execution_log.json")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.output_dir.join("validation")
    }

    /// Build a connector with credentials from the process environment
    ///
    /// Expected environment variables:
    /// - POWERBI_TOKEN: access token for Bearer auth (optional)
    /// - POWERBI_USERNAME / POWERBI_PASSWORD: Basic auth (optional)
    pub fn connector(&self) -> Result<PowerBiConnector> {
        self.connector_with(|key| std::env::var(key).ok())
    }

    pub fn connector_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<PowerBiConnector> {
        let url = Url::parse(&self.url).with_context(|| format!("Invalid POWERBI_URL: {}", self.url))?;
        let dataset = self
            .dataset
            .clone()
            .ok_or_else(|| eyre!("POWERBI_DATASET is not set"))?;
        let auth = Auth::detect(
            lookup("POWERBI_USERNAME"),
            lookup("POWERBI_PASSWORD"),
            lookup("POWERBI_TOKEN"),
        );
        if matches!(auth, Auth::None) {
            log::warn!("No POWERBI_TOKEN or POWERBI_USERNAME/POWERBI_PASSWORD set, connecting without credentials");
        }
        Ok(PowerBiConnector::new(url, dataset, auth))
    }
}
