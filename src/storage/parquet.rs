//! Columnar exporter

use crate::etl::{ExportFormat, Exporter, Period, ResultSet, export_file_name};
use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use eyre::{Context, Result};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writes result sets as snappy-compressed Parquet files
pub struct ParquetExporter {
    dir: PathBuf,
    dataset_label: String,
}

impl ParquetExporter {
    pub fn new(dir: impl AsRef<Path>, dataset_label: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create Parquet directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            dataset_label: dataset_label.to_string(),
        })
    }
}

fn writer_props() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_dictionary_enabled(true)
        .build()
}

/// Arrow type for a column, widened as values are seen
fn infer_type<'a>(values: impl Iterator<Item = &'a Value>) -> DataType {
    let mut inferred: Option<DataType> = None;
    for value in values {
        let seen = match value {
            Value::Null => continue,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_i64() => DataType::Int64,
            Value::Number(_) => DataType::Float64,
            _ => return DataType::Utf8,
        };
        inferred = Some(match (inferred, seen) {
            (None, seen) => seen,
            (Some(current), seen) if current == seen => current,
            (Some(DataType::Int64), DataType::Float64) | (Some(DataType::Float64), DataType::Int64) => {
                DataType::Float64
            }
            _ => return DataType::Utf8,
        });
    }
    inferred.unwrap_or(DataType::Utf8)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn build_column<'a>(data_type: &DataType, values: impl Iterator<Item = &'a Value>) -> ArrayRef {
    match data_type {
        DataType::Boolean => {
            let mut builder = BooleanBuilder::new();
            for value in values {
                builder.append_option(value.as_bool());
            }
            Arc::new(builder.finish())
        }
        DataType::Int64 => {
            let mut builder = Int64Builder::new();
            for value in values {
                builder.append_option(value.as_i64());
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::new();
            for value in values {
                builder.append_option(value.as_f64());
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = StringBuilder::new();
            for value in values {
                builder.append_option(text(value));
            }
            Arc::new(builder.finish())
        }
    }
}

/// Convert a result set into a single record batch
pub fn to_record_batch(result: &ResultSet) -> Result<RecordBatch> {
    if result.columns.is_empty() {
        eyre::bail!("Cannot write a result set without columns");
    }

    let types: Vec<DataType> = (0..result.columns.len())
        .map(|idx| infer_type(result.column_values(idx)))
        .collect();
    let schema = Arc::new(Schema::new(
        result
            .columns
            .iter()
            .zip(&types)
            .map(|(name, data_type)| Field::new(name, data_type.clone(), true))
            .collect::<Vec<_>>(),
    ));
    let arrays: Vec<ArrayRef> = types
        .iter()
        .enumerate()
        .map(|(idx, data_type)| build_column(data_type, result.column_values(idx)))
        .collect();

    RecordBatch::try_new(schema, arrays).context("Failed to build record batch")
}

impl Exporter for ParquetExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Parquet
    }

    fn export(&self, result: &ResultSet, period: &Period) -> Result<PathBuf> {
        let path = self
            .dir
            .join(export_file_name(&self.dataset_label, period, ExportFormat::Parquet));

        let batch = to_record_batch(result)?;
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create Parquet file: {}", path.display()))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_props()))?;
        writer.write(&batch)?;
        writer
            .close()
            .with_context(|| format!("Failed to finish Parquet file: {}", path.display()))?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_type_inference() {
        let ints = [json!(1), Value::Null, json!(3)];
        assert_eq!(infer_type(ints.iter()), DataType::Int64);

        let mixed_numbers = [json!(1), json!(2.5)];
        assert_eq!(infer_type(mixed_numbers.iter()), DataType::Float64);

        let bools = [json!(true), json!(false)];
        assert_eq!(infer_type(bools.iter()), DataType::Boolean);

        let mixed = [json!(1), json!("a")];
        assert_eq!(infer_type(mixed.iter()), DataType::Utf8);

        let nulls = [Value::Null];
        assert_eq!(infer_type(nulls.iter()), DataType::Utf8);
    }

    #[test]
    fn test_export_parquet() {
        let temp = TempDir::new().unwrap();
        let exporter = ParquetExporter::new(temp.path().join("parquet"), "sales").unwrap();
        let period = Period::month(2024, 2).unwrap();
        let result = ResultSet::new(
            vec![
                "Region".to_string(),
                "Amount".to_string(),
                "Count".to_string(),
                "Active".to_string(),
            ],
            vec![
                vec![json!("north"), json!(10.5), json!(1), json!(true)],
                vec![json!("south"), json!(3), Value::Null, json!(false)],
            ],
        );

        let path = exporter.export(&result, &period).unwrap();
        assert_eq!(path.file_name().unwrap(), "sales_2024_02_01_29.parquet");

        let file = std::fs::File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 2);

        let schema = batches[0].schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(1).data_type(), &DataType::Float64);
        assert_eq!(schema.field(2).data_type(), &DataType::Int64);
        assert_eq!(schema.field(3).data_type(), &DataType::Boolean);
    }

    #[test]
    fn test_no_columns_is_error() {
        let temp = TempDir::new().unwrap();
        let exporter = ParquetExporter::new(temp.path(), "sales").unwrap();
        let period = Period::month(2024, 2).unwrap();
        assert!(exporter.export(&ResultSet::default(), &period).is_err());
    }
}
