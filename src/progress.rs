//! Progress reporting capability
//!
//! The pipeline announces what it is doing through [`ProgressReporter`]. It
//! never consumes anything the reporter returns.

use crate::error::PeriodFailure;
use crate::etl::{Period, RunSummary, ValidationResult};
use owo_colors::OwoColorize;

/// Why a period was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already extracted in an earlier run
    Succeeded,
    /// Failed earlier and the failed-period policy holds it for manual reset
    HeldFailed,
}

/// Receives pipeline events
#[allow(unused_variables)]
pub trait ProgressReporter: Send + Sync {
    fn run_started(&self, periods: &[Period]) {}
    fn period_started(&self, period: &Period, index: usize, total: usize) {}
    fn period_skipped(&self, period: &Period, reason: SkipReason) {}
    fn period_succeeded(&self, period: &Period, rows: usize, attempts: u32) {}
    fn period_failed(&self, period: &Period, failure: &PeriodFailure) {}
    fn period_validated(&self, result: &ValidationResult) {}
    fn run_finished(&self, summary: &RunSummary) {}
}

/// Reports through the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn run_started(&self, periods: &[Period]) {
        if let (Some(first), Some(last)) = (periods.first(), periods.last()) {
            log::info!(
                "Export window: {} to {} ({} period(s))",
                first.label().cyan(),
                last.label().cyan(),
                periods.len()
            );
        }
    }

    fn period_started(&self, period: &Period, index: usize, total: usize) {
        log::info!("[{}/{}] Processing {}", index + 1, total, period.label().cyan());
    }

    fn period_skipped(&self, period: &Period, reason: SkipReason) {
        match reason {
            SkipReason::Succeeded => {
                log::info!("Skipping {} (already extracted)", period.label().bright_black())
            }
            SkipReason::HeldFailed => log::warn!(
                "Skipping {} (failed previously, reset to retry)",
                period.label().bright_black()
            ),
        }
    }

    fn period_succeeded(&self, period: &Period, rows: usize, attempts: u32) {
        log::info!(
            "✓ {} completed: {} row(s) in {} attempt(s)",
            period.label(),
            rows.green(),
            attempts
        );
    }

    fn period_failed(&self, period: &Period, failure: &PeriodFailure) {
        log::error!(
            "✗ {} failed after {} attempt(s) ({}): {}",
            period.label(),
            failure.attempts,
            failure.last_error_kind.red(),
            failure.message
        );
    }

    fn period_validated(&self, result: &ValidationResult) {
        if result.passed {
            log::info!(
                "✓ Validation for {} passed (expected {:.2}, actual {:.2})",
                result.period.label(),
                result.expected,
                result.actual
            );
        } else {
            log::warn!(
                "✗ Validation for {} failed: expected {:.2}, actual {:.2} ({:.4}% difference)",
                result.period.label(),
                result.expected,
                result.actual,
                result.percentage_difference
            );
        }
    }

    fn run_finished(&self, summary: &RunSummary) {
        log::info!(
            "Export summary: {} succeeded, {} failed, {} skipped, {} row(s)",
            summary.succeeded.green(),
            summary.failed.red(),
            summary.skipped,
            summary.total_rows
        );
        if !summary.failed_periods.is_empty() {
            log::warn!(
                "Failed periods: {}",
                summary
                    .failed_periods
                    .iter()
                    .map(|p| p.key())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if summary.cancelled {
            log::warn!("Run was cancelled before all periods were processed");
        }
    }
}
