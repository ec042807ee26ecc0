//! Rolling window of monthly periods

use crate::error::{Error, Result};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// One month-long unit of extraction work
///
/// Equality and ordering use `(year, month)` only; the day bounds are derived
/// from them.
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
    pub day_start: u32,
    pub day_end: u32,
}

impl Period {
    /// Build the period covering a whole calendar month
    pub fn month(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::InvalidRange(format!(
                "month must be between 1 and 12, got {}",
                month
            )));
        }
        let day_end = days_in_month(year, month).ok_or_else(|| {
            Error::InvalidRange(format!("{}-{:02} is not a representable date", year, month))
        })?;
        Ok(Self {
            year,
            month,
            day_start: 1,
            day_end,
        })
    }

    /// State store key, e.g. `2025-02`
    pub fn key(&self) -> String {
        format!("{}-{:02}", self.year, self.month)
    }

    /// File name suffix, e.g. `2025_02_01_28`
    pub fn file_suffix(&self) -> String {
        format!(
            "{}_{:02}_{:02}_{:02}",
            self.year, self.month, self.day_start, self.day_end
        )
    }

    /// Human readable label, e.g. `February 2025`
    pub fn label(&self) -> String {
        match NaiveDate::from_ymd_opt(self.year, self.month, 1) {
            Some(date) => date.format("%B %Y").to_string(),
            None => self.key(),
        }
    }

    /// The period immediately before this one
    fn previous(&self) -> Result<Self> {
        match self.month {
            1 => Self::month(self.year - 1, 12),
            m => Self::month(self.year, m - 1),
        }
    }
}

impl PartialEq for Period {
    fn eq(&self, other: &Self) -> bool {
        (self.year, self.month) == (other.year, other.month)
    }
}

impl std::hash::Hash for Period {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.year, self.month).hash(state);
    }
}

impl PartialOrd for Period {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Period {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.month).cmp(&(other.year, other.month))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl FromStr for Period {
    type Err = Error;

    /// Parse `YYYY-MM`
    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| Error::InvalidRange(format!("expected YYYY-MM, got '{}'", s)))?;
        let year = year
            .parse::<i32>()
            .map_err(|_| Error::InvalidRange(format!("invalid year in '{}'", s)))?;
        let month = month
            .parse::<u32>()
            .map_err(|_| Error::InvalidRange(format!("invalid month in '{}'", s)))?;
        Self::month(year, month)
    }
}

/// Order in which the pipeline walks a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IterationOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

impl FromStr for IterationOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "oldest-first" | "oldest" => Ok(Self::OldestFirst),
            "newest-first" | "newest" => Ok(Self::NewestFirst),
            other => Err(format!("unknown iteration order '{}'", other)),
        }
    }
}

/// Largest window accepted by [`compute`], one hundred years of months
pub const MAX_WINDOW_SIZE: usize = 1200;

/// Compute the `window_size` consecutive periods ending at `end_year`/`end_month`
///
/// Pure and deterministic. Periods come back in the requested order.
///
/// # Errors
/// Returns [`Error::InvalidRange`] if `window_size` is outside
/// 1..=[`MAX_WINDOW_SIZE`] or `end_month` is outside 1–12.
pub fn compute(
    end_year: i32,
    end_month: u32,
    window_size: usize,
    order: IterationOrder,
) -> Result<Vec<Period>> {
    if !(1..=MAX_WINDOW_SIZE).contains(&window_size) {
        return Err(Error::InvalidRange(format!(
            "window size must be between 1 and {}, got {}",
            MAX_WINDOW_SIZE, window_size
        )));
    }

    let mut periods = Vec::with_capacity(window_size);
    let mut current = Period::month(end_year, end_month)?;
    periods.push(current);
    while periods.len() < window_size {
        current = current.previous()?;
        periods.push(current);
    }

    if order == IterationOrder::OldestFirst {
        periods.reverse();
    }
    Ok(periods)
}

/// Number of days in a month, `None` if the date is out of chrono's range
fn days_in_month(year: i32, month: u32) -> Option<u32> {
    NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = match month {
        12 => NaiveDate::from_ymd_opt(year + 1, 1, 1)?,
        m => NaiveDate::from_ymd_opt(year, m + 1, 1)?,
    };
    Some(next.pred_opt()?.day())
}
