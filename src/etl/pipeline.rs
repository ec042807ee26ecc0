//! Rolling-window orchestration
//!
//! The pipeline walks the window one period at a time: skip what is already
//! done, extract the rest through the retry coordinator, export, record the
//! outcome. A failing period never stops the run; only configuration and
//! persistence errors do.

use super::classify::ErrorKind;
use super::connection::{ConnectionManager, Connector, SessionStatus};
use super::export::Exporters;
use super::query::QueryTemplate;
use super::retry::{Extraction, RetryCoordinator, RetryPolicy};
use super::validate::{ValidationResult, Validator, write_report};
use super::window::{IterationOrder, Period, compute};
use crate::error::{PeriodFailure, Result};
use crate::progress::{LogReporter, ProgressReporter, SkipReason};
use crate::storage::{PeriodStatus, RunLog, StateStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// What to do with periods that failed in an earlier run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailedPeriodPolicy {
    /// Retry them on every run
    #[default]
    Automatic,
    /// Skip them until the record is reset
    Manual,
}

impl FromStr for FailedPeriodPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "automatic" | "auto" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown failed-period policy '{}'", other)),
        }
    }
}

/// Parameters of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    pub end_year: i32,
    pub end_month: u32,
    pub window_size: usize,
    pub order: IterationOrder,
    /// Re-extract periods already marked succeeded
    pub force: bool,
}

impl RunRequest {
    /// A twelve-month, oldest-first window ending at `end_year`/`end_month`
    pub fn ending(end_year: i32, end_month: u32) -> Self {
        Self {
            end_year,
            end_month,
            window_size: 12,
            order: IterationOrder::default(),
            force: false,
        }
    }

    pub fn with_window(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_order(mut self, order: IterationOrder) -> Self {
        self.order = order;
        self
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub window_start: Option<Period>,
    pub window_end: Option<Period>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_rows: usize,
    #[serde(default)]
    pub failed_periods: Vec<Period>,
    #[serde(default)]
    pub validations: Vec<ValidationResult>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub duration_secs: f64,
}

impl RunSummary {
    /// Every period in the window ended succeeded, nothing was cancelled
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    pub fn validations_failed(&self) -> usize {
        self.validations.iter().filter(|v| !v.passed).count()
    }
}

/// Sequential extractor for a rolling window of monthly periods
pub struct Pipeline<C: Connector> {
    connection: ConnectionManager<C>,
    coordinator: RetryCoordinator,
    template: QueryTemplate,
    exporters: Exporters,
    state: StateStore,
    reporter: Box<dyn ProgressReporter>,
    failed_policy: FailedPeriodPolicy,
    validator: Option<Validator>,
    validation_dir: Option<PathBuf>,
    run_log: Option<RunLog>,
    cancel: Arc<AtomicBool>,
}

impl<C: Connector> Pipeline<C> {
    pub fn new(
        connection: ConnectionManager<C>,
        template: QueryTemplate,
        exporters: Exporters,
        state: StateStore,
    ) -> Self {
        Self {
            connection,
            coordinator: RetryCoordinator::default(),
            template,
            exporters,
            state,
            reporter: Box::new(LogReporter),
            failed_policy: FailedPeriodPolicy::default(),
            validator: None,
            validation_dir: None,
            run_log: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.coordinator = RetryCoordinator::new(policy);
        self
    }

    pub fn with_reporter(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn with_failed_policy(mut self, policy: FailedPeriodPolicy) -> Self {
        self.failed_policy = policy;
        self
    }

    /// Validate every extracted period; reports go to `report_dir` when set
    pub fn with_validator(mut self, validator: Validator, report_dir: Option<PathBuf>) -> Self {
        self.validator = Some(validator);
        self.validation_dir = report_dir;
        self
    }

    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Share an existing cancellation flag, e.g. one set by a signal handler
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag that stops the run before the next period once set
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    /// Run the pipeline over the requested window
    ///
    /// # Errors
    /// Returns [`Error::InvalidRange`](crate::error::Error::InvalidRange)
    /// before touching anything if the window is invalid, and
    /// [`Error::State`](crate::error::Error::State) if the state file cannot be
    /// written. The session is closed either way. Period failures are
    /// recorded and reported in the summary.
    pub async fn run(&mut self, request: &RunRequest) -> Result<RunSummary> {
        let periods = compute(
            request.end_year,
            request.end_month,
            request.window_size,
            request.order,
        )?;
        let started = Instant::now();
        let mut summary = RunSummary {
            window_start: periods.iter().min().copied(),
            window_end: periods.iter().max().copied(),
            ..RunSummary::default()
        };
        self.reporter.run_started(&periods);

        let walked = self.walk(&periods, request.force, &mut summary).await;
        self.connection.close().await;
        walked?;

        if let Some(dir) = &self.validation_dir {
            match write_report(dir, &summary.validations) {
                Ok(Some(path)) => log::info!("Validation report written to {}", path.display()),
                Ok(None) => {}
                Err(e) => log::warn!("Could not write validation report: {}", e),
            }
        }

        summary.duration_secs = started.elapsed().as_secs_f64();
        self.reporter.run_finished(&summary);

        if let Some(run_log) = &self.run_log
            && let Err(e) = run_log.append(&summary)
        {
            log::warn!("Could not append to execution log: {}", e);
        }

        Ok(summary)
    }

    /// Extract every period in order, stopping early on cancellation
    async fn walk(
        &mut self,
        periods: &[Period],
        force: bool,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let total = periods.len();
        for (index, period) in periods.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                log::warn!(
                    "Cancelled, skipping {} remaining period(s)",
                    total - index
                );
                summary.cancelled = true;
                break;
            }

            if let Some(reason) = self.skip_reason(period, force) {
                self.reporter.period_skipped(period, reason);
                summary.skipped += 1;
                continue;
            }

            self.reporter.period_started(period, index, total);
            self.state.mark_pending(period)?;

            if self.connection.status() == SessionStatus::Open && !self.connection.is_alive().await {
                log::info!("Session no longer responds, reconnecting before {}", period);
            }

            match self.coordinator.run(&mut self.connection, &self.template, period).await {
                Ok(extraction) => self.finish_period(period, extraction, summary).await?,
                Err(failure) => {
                    self.state.mark_failed(&failure)?;
                    self.reporter.period_failed(period, &failure);
                    summary.failed += 1;
                    summary.failed_periods.push(*period);
                }
            }
        }

        Ok(())
    }

    fn skip_reason(&self, period: &Period, force: bool) -> Option<SkipReason> {
        if force {
            return None;
        }
        match self.state.status(period)? {
            PeriodStatus::Succeeded => Some(SkipReason::Succeeded),
            PeriodStatus::Failed if self.failed_policy == FailedPeriodPolicy::Manual => {
                Some(SkipReason::HeldFailed)
            }
            PeriodStatus::Failed | PeriodStatus::Pending => None,
        }
    }

    async fn finish_period(
        &mut self,
        period: &Period,
        extraction: Extraction,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let attempts = extraction.attempt_count();
        let rows = extraction.result.len();

        let files = if extraction.result.is_empty() {
            log::warn!("{} returned no rows, nothing exported", period);
            Vec::new()
        } else {
            match self.exporters.export_all(&extraction.result, period) {
                Ok(files) => files,
                Err(e) => {
                    let failure = PeriodFailure {
                        period: *period,
                        last_error_kind: ErrorKind::Fatal,
                        attempts,
                        message: format!("export failed: {:#}", e),
                    };
                    self.state
                        .record_failure(period, None, attempts, failure.message.clone())?;
                    self.reporter.period_failed(period, &failure);
                    summary.failed += 1;
                    summary.failed_periods.push(*period);
                    return Ok(());
                }
            }
        };

        self.state.mark_succeeded(period, attempts, rows, files)?;
        self.reporter.period_succeeded(period, rows, attempts);
        summary.succeeded += 1;
        summary.total_rows += rows;

        if let Some(validator) = &self.validator {
            match validator
                .validate(&self.coordinator, &mut self.connection, period, &extraction.result)
                .await
            {
                Ok(result) => {
                    self.reporter.period_validated(&result);
                    summary.validations.push(result);
                }
                Err(failure) => log::warn!("Validation of {} could not run: {}", period, failure),
            }
        }

        Ok(())
    }
}
