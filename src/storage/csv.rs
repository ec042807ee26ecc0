//! Delimited text exporter

use crate::etl::{ExportFormat, Exporter, Period, ResultSet, export_file_name};
use eyre::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Writes result sets as comma separated files with a header row
pub struct CsvExporter {
    dir: PathBuf,
    dataset_label: String,
    delimiter: u8,
}

impl CsvExporter {
    pub fn new(dir: impl AsRef<Path>, dataset_label: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create CSV directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            dataset_label: dataset_label.to_string(),
            delimiter: b',',
        })
    }

    /// Use another single-byte delimiter, e.g. `b';'`
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Exporter for CsvExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Csv
    }

    fn export(&self, result: &ResultSet, period: &Period) -> Result<PathBuf> {
        let path = self
            .dir
            .join(export_file_name(&self.dataset_label, period, ExportFormat::Csv));

        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_path(&path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;

        writer.write_record(&result.columns)?;
        for row in &result.rows {
            writer.write_record(row.iter().map(cell_text))?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write CSV file: {}", path.display()))?;

        Ok(path)
    }
}
