//! CLI helper functions

use crate::{
    config::Settings,
    etl::{
        ConnectionManager, Connector, ExportFormat, Exporters, IterationOrder, Period, Pipeline,
        QueryTemplate, RunRequest, RunSummary, Validator,
    },
    progress::LogReporter,
    storage::{PeriodStatus, RunLog, StateStore},
};
use chrono::Datelike;
use eyre::{Context, Result};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Command line overrides for one extraction
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Last period of the window, defaults to the current month
    pub end: Option<Period>,
    pub window: Option<usize>,
    pub force: bool,
    pub formats: Option<Vec<ExportFormat>>,
    pub order: Option<IterationOrder>,
}

impl ExtractOptions {
    /// Apply the overrides and produce the run request
    pub fn resolve(&self, settings: &mut Settings) -> Result<RunRequest> {
        if let Some(formats) = &self.formats {
            settings.formats = formats.clone();
        }
        if let Some(order) = self.order {
            settings.order = order;
        }
        if let Some(window) = self.window {
            settings.window_size = window;
        }

        let end = match self.end {
            Some(end) => end,
            None => {
                let today = chrono::Local::now().date_naive();
                Period::month(today.year(), today.month())?
            }
        };

        Ok(RunRequest::ending(end.year, end.month)
            .with_window(settings.window_size)
            .with_order(settings.order)
            .forced(self.force))
    }
}

/// What `reset` removes from the state file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    Failed,
    All,
    Period(Period),
}

/// Extract the window against the configured Power BI dataset
pub async fn run_extract(
    settings: Settings,
    options: &ExtractOptions,
    cancel: Arc<AtomicBool>,
) -> Result<RunSummary> {
    let connector = settings.connector()?;
    log::info!("Connecting to {}", connector.to_string().bright_black());
    extract_with(connector, settings, options, cancel).await
}

/// Build the pipeline from settings around any connector and run it
///
/// Pipeline: window → (skip | extract with retries → export → validate) → state
pub async fn extract_with<C: Connector>(
    connector: C,
    mut settings: Settings,
    options: &ExtractOptions,
    cancel: Arc<AtomicBool>,
) -> Result<RunSummary> {
    let request = options.resolve(&mut settings)?;
    settings.validate()?;

    log::debug!("Loading query template from {}", settings.query_path.display());
    let template = QueryTemplate::read(&settings.query_path)?;

    let exporters = Exporters::for_formats(
        &settings.output_dir,
        &settings.dataset_label,
        &settings.formats,
    )?;
    let state = StateStore::open(&settings.state_file)?;
    let connection = ConnectionManager::new(connector, settings.timeouts());

    let mut pipeline = Pipeline::new(connection, template, exporters, state)
        .with_retry_policy(settings.retry_policy())
        .with_reporter(LogReporter)
        .with_failed_policy(settings.failed_policy)
        .with_run_log(RunLog::new(settings.run_log_path()))
        .with_cancel_flag(cancel);

    if let (Some(path), Some(column)) = (&settings.validation_query_path, &settings.amount_column) {
        let template = QueryTemplate::read(path)
            .with_context(|| format!("Failed to load validation query {}", path.display()))?;
        pipeline = pipeline.with_validator(
            Validator::new(template, column.clone())
                .with_tolerance_percent(settings.validation_tolerance_percent),
            Some(settings.validation_dir()),
        );
    }

    log::info!(
        "Exporting {} as {} into {}",
        settings.dataset_label.cyan(),
        settings
            .formats
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        settings.output_dir.display().bright_black()
    );

    let summary = pipeline.run(&request).await?;
    Ok(summary)
}

/// Log every record in the state file, oldest period first
pub fn show_status(settings: &Settings) -> Result<usize> {
    let store = StateStore::open(&settings.state_file)?;
    if store.is_empty() {
        log::info!("No periods recorded in {}", store.path().display());
        return Ok(0);
    }

    log::info!("State file: {}", store.path().display().bright_black());
    for record in store.records() {
        let status = match record.status {
            PeriodStatus::Succeeded => record.status.green().to_string(),
            PeriodStatus::Failed => record.status.red().to_string(),
            PeriodStatus::Pending => record.status.yellow().to_string(),
        };
        let detail = match (record.status, &record.last_error_kind, &record.last_error) {
            (PeriodStatus::Failed, Some(kind), Some(message)) => format!("{}: {}", kind, message),
            (PeriodStatus::Failed, None, Some(message)) => message.clone(),
            _ => record
                .rows
                .map(|rows| format!("{} row(s), {} file(s)", rows, record.files.len()))
                .unwrap_or_default(),
        };
        log::info!(
            "{}  {:<9}  attempts: {}  updated: {}  {}",
            record.period.key().cyan(),
            status,
            record.last_attempt_count,
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
            detail.bright_black()
        );
    }
    Ok(store.len())
}

/// Remove records from the state file so the periods are extracted again
pub fn reset_state(settings: &Settings, scope: ResetScope) -> Result<usize> {
    let mut store = StateStore::open(&settings.state_file)?;
    let removed = match scope {
        ResetScope::Failed => store.remove_failed()?,
        ResetScope::All => store.clear()?,
        ResetScope::Period(period) => usize::from(store.remove(&period)?),
    };
    log::info!(
        "✓ Removed {} record(s) from {}",
        removed,
        store.path().display()
    );
    Ok(removed)
}

/// Open a session, probe it and close it again
pub async fn test_auth(settings: &Settings) -> Result<()> {
    let connector = settings.connector()?;
    log::info!("Testing authorization to {}", connector.to_string().bright_black());
    check_connection(connector, settings).await
}

pub async fn check_connection<C: Connector>(connector: C, settings: &Settings) -> Result<()> {
    let mut connection = ConnectionManager::new(connector, settings.timeouts());
    connection
        .open()
        .await
        .context("Failed to open a session")?;
    let alive = connection.is_alive().await;
    connection.close().await;

    if !alive {
        eyre::bail!("Session opened but did not answer the liveness probe");
    }
    log::info!("✓ Authorization succeeded");
    Ok(())
}
