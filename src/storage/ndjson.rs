//! NDJSON (Newline Delimited JSON) exporter

use crate::etl::{ExportFormat, Exporter, Period, ResultSet, export_file_name};
use eyre::{Context, Result};
use serde_json::{Map, Value};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes one JSON object per row, keyed by column name
pub struct NdjsonExporter {
    dir: PathBuf,
    dataset_label: String,
}

impl NdjsonExporter {
    pub fn new(dir: impl AsRef<Path>, dataset_label: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create NDJSON directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            dataset_label: dataset_label.to_string(),
        })
    }
}

/// Turn a row into an object in column order
fn row_object(columns: &[String], row: &[Value]) -> Value {
    let object: Map<String, Value> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), row.get(i).cloned().unwrap_or(Value::Null)))
        .collect();
    Value::Object(object)
}

impl Exporter for NdjsonExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Ndjson
    }

    fn export(&self, result: &ResultSet, period: &Period) -> Result<PathBuf> {
        let path = self
            .dir
            .join(export_file_name(&self.dataset_label, period, ExportFormat::Ndjson));

        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to write NDJSON file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for row in &result.rows {
            serde_json::to_writer(&mut writer, &row_object(&result.columns, row))?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        Ok(path)
    }
}
