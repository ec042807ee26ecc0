//! Query templates, execution and tabular results

use super::connection::{ConnectionManager, Connector, Session};
use super::window::Period;
use crate::error::{Error, QueryError};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

/// Placeholders a template may reference
pub const PLACEHOLDERS: [&str; 4] = ["year", "month", "day_start", "day_end"];

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Tabular data returned by a query: ordered columns, ordered rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name
    ///
    /// Matches exactly first, then ignoring the table prefix, brackets and
    /// case. A loose match that fits more than one column finds nothing.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        if let Some(idx) = self.columns.iter().position(|c| c == name) {
            return Some(idx);
        }
        let wanted = column_key(name);
        let mut matches = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| column_key(c) == wanted)
            .map(|(idx, _)| idx);
        match (matches.next(), matches.next()) {
            (Some(idx), None) => Some(idx),
            (Some(_), Some(_)) => {
                log::warn!("Column name '{}' matches more than one column", name);
                None
            }
            _ => None,
        }
    }

    /// Iterate the values of one column
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().map(move |row| row.get(idx).unwrap_or(&Value::Null))
    }

    /// Sum of the numeric cells of a column, `None` if the column is absent
    pub fn sum_column(&self, name: &str) -> Option<f64> {
        let idx = self.column_index(name)?;
        Some(self.column_values(idx).filter_map(numeric).sum())
    }
}

/// Interpret a cell as a number (numeric strings included)
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn column_key(name: &str) -> String {
    let bare = match name.rfind('[') {
        Some(start) if name.ends_with(']') => &name[start + 1..name.len() - 1],
        _ => name,
    };
    bare.to_lowercase()
}

/// A parsed query template
///
/// Placeholders are written `{year}`, `{month}`, `{day_start}` and `{day_end}`.
/// `{{` and `}}` produce literal braces; any other brace is left untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTemplate {
    text: String,
}

impl QueryTemplate {
    /// Validate a template
    ///
    /// # Errors
    /// Returns [`Error::Template`] if the text references a placeholder that a
    /// period cannot supply.
    pub fn parse(text: impl Into<String>) -> Result<Self, Error> {
        let text = text.into();
        let unknown: Vec<String> = PLACEHOLDER_RE
            .captures_iter(&text)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .filter(|name| !PLACEHOLDERS.contains(&name.as_str()))
            .collect();

        if !unknown.is_empty() {
            return Err(Error::Template(format!(
                "unknown placeholder(s) {}; available: {}",
                unknown
                    .iter()
                    .map(|n| format!("{{{}}}", n))
                    .collect::<Vec<_>>()
                    .join(", "),
                PLACEHOLDERS.join(", ")
            )));
        }
        if text.trim().is_empty() {
            return Err(Error::Template("query template is empty".to_string()));
        }

        Ok(Self { text })
    }

    /// Read and validate a template file
    pub fn read(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Template(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(text)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Substitute a period's values
    pub fn render(&self, period: &Period) -> String {
        PLACEHOLDER_RE
            .replace_all(&self.text, |caps: &Captures| match caps.get(1) {
                Some(name) => match name.as_str() {
                    "year" => period.year.to_string(),
                    "month" => period.month.to_string(),
                    "day_start" => period.day_start.to_string(),
                    "day_end" => period.day_end.to_string(),
                    // parse() rejected everything else
                    other => format!("{{{}}}", other),
                },
                None => caps[0][..1].to_string(),
            })
            .into_owned()
    }
}

/// Runs rendered templates against the managed session
///
/// Never changes the connection's lifecycle state; recovering from a failure
/// is the caller's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryExecutor;

impl QueryExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Execute the template for one period
    ///
    /// A command that outlives the manager's command timeout surfaces as
    /// [`QueryError::Timeout`].
    pub async fn execute<C: Connector>(
        &self,
        connection: &ConnectionManager<C>,
        template: &QueryTemplate,
        period: &Period,
    ) -> Result<ResultSet, QueryError> {
        let session = connection
            .session()
            .ok_or_else(|| QueryError::Connection("no open session".to_string()))?;
        let timeouts = connection.timeouts();
        let text = template.render(period);

        log::trace!("Query for {}:\n{}", period, text);

        match tokio::time::timeout(timeouts.command, session.query(&text, &timeouts)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(format!(
                "no response within {}s",
                timeouts.command.as_secs_f64()
            ))),
        }
    }
}
