//! Rolling Export
//!
//! Resumable extraction of a rolling window of monthly periods from an
//! analytical query service into CSV, Parquet and NDJSON files

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod etl;
pub mod progress;
pub mod storage;

// Re-exports for convenience
pub use client::{Auth, AuthType, PowerBiConnector};
pub use config::Settings;
pub use error::{Error, PeriodFailure, QueryError};
pub use etl::{
    ConnectionManager, Connector, ExportFormat, Exporter, Exporters, IterationOrder, Period,
    Pipeline, QueryTemplate, RetryCoordinator, RetryPolicy, RunRequest, RunSummary, Session,
};
pub use progress::{LogReporter, ProgressReporter, SkipReason};
pub use storage::{PeriodRecord, PeriodStatus, StateStore};
