//! Totals validation
//!
//! After a period is exported, a second query asks the service for the
//! period's total of an amount column. The total must match the sum of that
//! column in the extracted rows within a small relative tolerance.

use super::connection::{ConnectionManager, Connector};
use super::query::{QueryTemplate, ResultSet, numeric};
use super::retry::RetryCoordinator;
use super::window::Period;
use crate::error::PeriodFailure;
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Largest accepted difference, in percent of the expected total
pub const DEFAULT_TOLERANCE_PERCENT: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub period: Period,
    pub expected: f64,
    pub actual: f64,
    pub difference: f64,
    pub percentage_difference: f64,
    pub row_count: usize,
    pub passed: bool,
    pub validated_at: DateTime<Utc>,
}

/// Compares extracted rows against a server-side total
#[derive(Debug, Clone)]
pub struct Validator {
    template: QueryTemplate,
    amount_column: String,
    tolerance_percent: f64,
}

impl Validator {
    pub fn new(template: QueryTemplate, amount_column: impl Into<String>) -> Self {
        Self {
            template,
            amount_column: amount_column.into(),
            tolerance_percent: DEFAULT_TOLERANCE_PERCENT,
        }
    }

    pub fn with_tolerance_percent(mut self, tolerance_percent: f64) -> Self {
        self.tolerance_percent = tolerance_percent;
        self
    }

    /// First numeric cell of the first row
    pub fn expected_total(result: &ResultSet) -> Option<f64> {
        result.rows.first()?.iter().find_map(numeric)
    }

    /// Compare an expected total with the extracted rows
    pub fn compare(&self, period: &Period, expected: f64, extracted: &ResultSet) -> ValidationResult {
        let actual = extracted.sum_column(&self.amount_column).unwrap_or_else(|| {
            log::warn!(
                "Amount column '{}' not found in {} result, validating against 0",
                self.amount_column,
                period
            );
            0.0
        });
        let difference = (expected - actual).abs();
        let percentage_difference = if expected != 0.0 {
            difference / expected.abs() * 100.0
        } else if actual == 0.0 {
            0.0
        } else {
            100.0
        };

        ValidationResult {
            period: *period,
            expected,
            actual,
            difference,
            percentage_difference,
            row_count: extracted.len(),
            passed: percentage_difference < self.tolerance_percent,
            validated_at: Utc::now(),
        }
    }

    /// Run the validation query for `period` and compare
    ///
    /// The query goes through the same retry coordinator as the extraction.
    pub async fn validate<C: Connector>(
        &self,
        coordinator: &RetryCoordinator,
        connection: &mut ConnectionManager<C>,
        period: &Period,
        extracted: &ResultSet,
    ) -> Result<ValidationResult, PeriodFailure> {
        let totals = coordinator.run(connection, &self.template, period).await?;
        let expected = Self::expected_total(&totals.result).unwrap_or_else(|| {
            log::warn!("Validation query for {} returned no total", period);
            0.0
        });
        Ok(self.compare(period, expected, extracted))
    }
}

#[derive(Debug, Serialize)]
struct ValidationReport<'a> {
    generated_at: DateTime<Utc>,
    validated: usize,
    passed: usize,
    failed: usize,
    total_expected: f64,
    total_actual: f64,
    results: &'a [ValidationResult],
}

/// Write `results` to `<dir>/validation_report_<timestamp>.json`
///
/// Returns `None` without writing anything if there are no results.
pub fn write_report(dir: impl AsRef<Path>, results: &[ValidationResult]) -> Result<Option<PathBuf>> {
    if results.is_empty() {
        return Ok(None);
    }
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create validation directory: {}", dir.display()))?;

    let now = Utc::now();
    let passed = results.iter().filter(|r| r.passed).count();
    let report = ValidationReport {
        generated_at: now,
        validated: results.len(),
        passed,
        failed: results.len() - passed,
        total_expected: results.iter().map(|r| r.expected).sum(),
        total_actual: results.iter().map(|r| r.actual).sum(),
        results,
    };

    let path = dir.join(format!(
        "validation_report_{}.json",
        now.format("%Y%m%d_%H%M%S")
    ));
    std::fs::write(&path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("Failed to write validation report: {}", path.display()))?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn validator() -> Validator {
        Validator::new(
            QueryTemplate::parse("EVALUATE ROW(\"Total\", {year})").unwrap(),
            "AmountInEuro",
        )
    }

    fn extracted(amounts: &[f64]) -> ResultSet {
        ResultSet::new(
            vec!["Cases[Id]".to_string(), "Cases[AmountInEuro]".to_string()],
            amounts
                .iter()
                .enumerate()
                .map(|(i, a)| vec![json!(i), json!(a)])
                .collect(),
        )
    }

    #[test]
    fn test_matching_totals_pass() {
        let period = Period::month(2025, 1).unwrap();
        let result = validator().compare(&period, 30.0, &extracted(&[10.0, 20.0]));
        assert!(result.passed);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.difference, 0.0);
    }

    #[test]
    fn test_mismatch_fails() {
        let period = Period::month(2025, 1).unwrap();
        let result = validator().compare(&period, 100.0, &extracted(&[10.0, 20.0]));
        assert!(!result.passed);
        assert!((result.percentage_difference - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_custom_tolerance() {
        let period = Period::month(2025, 1).unwrap();
        let loose = validator().with_tolerance_percent(5.0);
        assert!(loose.compare(&period, 100.0, &extracted(&[97.0])).passed);
        assert!(!validator().compare(&period, 100.0, &extracted(&[97.0])).passed);
    }

    #[test]
    fn test_zero_expected_total() {
        let period = Period::month(2025, 1).unwrap();
        assert!(validator().compare(&period, 0.0, &extracted(&[])).passed);
        assert!(!validator().compare(&period, 0.0, &extracted(&[5.0])).passed);
    }

    #[test]
    fn test_expected_total_from_first_row() {
        let totals = ResultSet::new(
            vec!["[Label]".to_string(), "[SumAmountInEuro]".to_string()],
            vec![vec![json!("total"), json!("1234.5")]],
        );
        assert_eq!(Validator::expected_total(&totals), Some(1234.5));
        assert_eq!(Validator::expected_total(&ResultSet::default()), None);
    }

    #[test]
    fn test_write_report() {
        let temp = TempDir::new().unwrap();
        assert!(write_report(temp.path(), &[]).unwrap().is_none());

        let period = Period::month(2025, 1).unwrap();
        let result = validator().compare(&period, 30.0, &extracted(&[30.0]));
        let path = write_report(temp.path().join("validation"), &[result])
            .unwrap()
            .unwrap();
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(report["validated"], 1);
        assert_eq!(report["passed"], 1);
    }
}
