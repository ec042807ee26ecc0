//! File system storage
//!
//! - Period state persistence
//! - CSV, Parquet and NDJSON exporters
//! - Execution log

mod csv;
mod ndjson;
mod parquet;
mod run_log;
mod state;

pub use self::csv::CsvExporter;
pub use ndjson::NdjsonExporter;
pub use self::parquet::{ParquetExporter, to_record_batch};
pub use run_log::{DEFAULT_RETAINED_RUNS, RunLog, RunLogEntry};
pub use state::{PeriodRecord, PeriodStatus, StateStore};
