//! Rolling-window extraction
//!
//! Building blocks, bottom-up:
//! - [`compute`]: which months to extract
//! - [`ConnectionManager`]: one remote session and its lifecycle
//! - [`QueryExecutor`]: one templated query for one period
//! - [`classify`]: map a raw failure to a recovery action
//! - [`RetryCoordinator`]: bounded retries for one period
//! - [`Exporters`]: write a result set in every configured format
//! - [`Pipeline`]: walk the window and record outcomes

mod classify;
mod connection;
mod export;
mod pipeline;
mod query;
mod retry;
mod validate;
mod window;

pub use classify::{ErrorKind, Recovery, classify};
pub use connection::{
    ConnectionManager, Connector, MAX_CONNECT_TIMEOUT, Session, SessionStatus, Timeouts,
};
pub use export::{ExportFormat, Exporter, Exporters, export_file_name};
pub use pipeline::{FailedPeriodPolicy, Pipeline, RunRequest, RunSummary};
pub use query::{PLACEHOLDERS, QueryExecutor, QueryTemplate, ResultSet, numeric};
pub use retry::{AttemptOutcome, Extraction, ExtractionAttempt, RetryCoordinator, RetryPolicy};
pub use validate::{DEFAULT_TOLERANCE_PERCENT, ValidationResult, Validator, write_report};
pub use window::{IterationOrder, MAX_WINDOW_SIZE, Period, compute};
