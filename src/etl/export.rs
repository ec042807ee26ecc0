//! Export capability
//!
//! Each output format implements [`Exporter`]. The pipeline only talks to the
//! [`Exporters`] registry, so a new format never touches the pipeline.

use super::query::ResultSet;
use super::window::Period;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Row-oriented delimited text
    Csv,
    /// Columnar binary
    Parquet,
    /// One JSON object per line
    Ndjson,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
            Self::Ndjson => "ndjson",
        }
    }

    /// Parse a comma separated list such as `csv,parquet`
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        let mut formats = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let format = item.parse::<Self>()?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        if formats.is_empty() {
            eyre::bail!("At least one export format is required");
        }
        Ok(formats)
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "parquet" => Ok(Self::Parquet),
            "ndjson" | "jsonl" => Ok(Self::Ndjson),
            other => eyre::bail!("Unknown export format '{}' (expected csv, parquet or ndjson)", other),
        }
    }
}

/// Output file name for a period: `<label>_<YYYY>_<MM>_<DD>_<DD>.<ext>`
pub fn export_file_name(dataset_label: &str, period: &Period, format: ExportFormat) -> String {
    format!(
        "{}_{}.{}",
        dataset_label,
        period.file_suffix(),
        format.extension()
    )
}

/// Writes one result set to one file
pub trait Exporter: Send + Sync {
    fn format(&self) -> ExportFormat;

    /// Write `result` for `period`, overwriting any previous file, and return its path
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    fn export(&self, result: &ResultSet, period: &Period) -> Result<PathBuf>;
}

/// The configured set of exporters, one per format
#[derive(Default)]
pub struct Exporters {
    exporters: Vec<Box<dyn Exporter>>,
}

impl Exporters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard file exporters for `formats`, each writing into `<output_dir>/<ext>/`
    pub fn for_formats(
        output_dir: impl AsRef<Path>,
        dataset_label: &str,
        formats: &[ExportFormat],
    ) -> Result<Self> {
        use crate::storage::{CsvExporter, NdjsonExporter, ParquetExporter};

        let output_dir = output_dir.as_ref();
        let mut exporters = Self::new();
        for format in formats {
            let dir = output_dir.join(format.extension());
            let exporter: Box<dyn Exporter> = match format {
                ExportFormat::Csv => Box::new(CsvExporter::new(&dir, dataset_label)?),
                ExportFormat::Parquet => Box::new(ParquetExporter::new(&dir, dataset_label)?),
                ExportFormat::Ndjson => Box::new(NdjsonExporter::new(&dir, dataset_label)?),
            };
            exporters.register(exporter);
        }
        Ok(exporters)
    }

    /// Add an exporter, replacing any existing one for the same format
    pub fn register(&mut self, exporter: Box<dyn Exporter>) {
        self.exporters.retain(|e| e.format() != exporter.format());
        self.exporters.push(exporter);
    }

    pub fn formats(&self) -> Vec<ExportFormat> {
        self.exporters.iter().map(|e| e.format()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    /// Export through the exporter registered for `format`
    pub fn export(
        &self,
        result: &ResultSet,
        period: &Period,
        format: ExportFormat,
    ) -> Result<PathBuf> {
        let exporter = self
            .exporters
            .iter()
            .find(|e| e.format() == format)
            .ok_or_else(|| eyre::eyre!("No exporter registered for {}", format))?;
        exporter.export(result, period)
    }

    /// Export through every registered exporter, in registration order
    pub fn export_all(&self, result: &ResultSet, period: &Period) -> Result<Vec<PathBuf>> {
        self.exporters
            .iter()
            .map(|e| {
                let path = e.export(result, period)?;
                log::debug!("{} exported to {}", e.format(), path.display());
                Ok(path)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullExporter(ExportFormat);

    impl Exporter for NullExporter {
        fn format(&self) -> ExportFormat {
            self.0
        }
        fn export(&self, _result: &ResultSet, period: &Period) -> Result<PathBuf> {
            Ok(PathBuf::from(export_file_name("null", period, self.0)))
        }
    }

    #[test]
    fn test_file_name_convention() {
        let period = Period::month(2025, 2).unwrap();
        assert_eq!(
            export_file_name("billing_cases", &period, ExportFormat::Parquet),
            "billing_cases_2025_02_01_28.parquet"
        );
    }

    #[test]
    fn test_parse_list() {
        let formats = ExportFormat::parse_list("csv, parquet,csv").unwrap();
        assert_eq!(formats, vec![ExportFormat::Csv, ExportFormat::Parquet]);
        assert!(ExportFormat::parse_list("").is_err());
        assert!(ExportFormat::parse_list("xlsx").is_err());
    }

    #[test]
    fn test_registry_dispatch() {
        let mut exporters = Exporters::new();
        exporters.register(Box::new(NullExporter(ExportFormat::Csv)));
        exporters.register(Box::new(NullExporter(ExportFormat::Ndjson)));
        exporters.register(Box::new(NullExporter(ExportFormat::Csv)));
        assert_eq!(
            exporters.formats(),
            vec![ExportFormat::Ndjson, ExportFormat::Csv]
        );

        let period = Period::month(2024, 8).unwrap();
        let rs = ResultSet::default();
        let path = exporters.export(&rs, &period, ExportFormat::Csv).unwrap();
        assert_eq!(path, PathBuf::from("null_2024_08_01_31.csv"));
        assert!(exporters.export(&rs, &period, ExportFormat::Parquet).is_err());
        assert_eq!(exporters.export_all(&rs, &period).unwrap().len(), 2);
    }
}
