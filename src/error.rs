//! Error taxonomy
//!
//! Two layers:
//! - [`QueryError`] is a raw, per-attempt failure from opening a session or
//!   running a query. These never escape the retry coordinator.
//! - [`Error`] is a run-level failure. Only configuration, template and
//!   persistence problems are fatal to a run; a period that exhausts its
//!   retries is reported as a [`PeriodFailure`] and the run continues.

use crate::etl::{ErrorKind, Period};
use thiserror::Error;

/// A single failed attempt against the remote query service
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    /// The session could not be opened (network, authentication)
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server no longer recognises the session
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The command did not complete within the command timeout
    #[error("query timed out: {0}")]
    Timeout(String),

    /// Generic execution fault reported by the service
    #[error("query execution failed: {0}")]
    Execution(String),

    /// The service refused the request as malformed or forbidden
    #[error("query rejected: {0}")]
    Rejected(String),

    /// The query text could not be produced from the template
    #[error("template error: {0}")]
    Template(String),
}

/// Terminal failure of one period after the retry budget was spent
#[derive(Debug, Clone, Error, PartialEq)]
#[error("extraction of {period} abandoned after {attempts} attempt(s) ({last_error_kind}): {message}")]
pub struct PeriodFailure {
    pub period: Period,
    pub last_error_kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

/// Run-level errors
#[derive(Debug, Error)]
pub enum Error {
    /// Bad window parameters; aborts before any extraction
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// The query template is malformed; every period shares it, so the run aborts
    #[error("template error: {0}")]
    Template(String),

    /// Terminal per-period failure (recorded, never fatal to a run)
    #[error(transparent)]
    PeriodExtractionFailed(#[from] PeriodFailure),

    /// The state file could not be read or written
    #[error("state store error: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
