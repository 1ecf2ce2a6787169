//! Consolidated dataset storage (Arrow/CSV/Parquet)
//!
//! The aggregated dataset is text-typed: every cell of every artifact is kept
//! verbatim, so merging artifacts never has to reconcile inferred column
//! types across universes. Null cells are cells an artifact did not have.
//!
//! Write pattern: the dataset is built in memory and written once, through a
//! temp file and a rename, so a reader never sees a partial output file.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::artifact::write_atomic;
use crate::{Error, Result};

/// Leading column holding the universe identity.
pub const UNIVERSE_ID_COLUMN: &str = "mv_universe_id";

/// Prefix of the leading dimension-value columns.
pub const DIMENSION_COLUMN_PREFIX: &str = "mv_dim_";

/// Column name carrying the value of dimension `name`.
#[must_use]
pub fn dimension_column(name: &str) -> String {
    format!("{DIMENSION_COLUMN_PREFIX}{name}")
}

/// Row-oriented, all-text table of aggregated universe records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedDataset {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl AggregatedDataset {
    /// Empty dataset with the given header.
    #[must_use]
    pub const fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns error if the row width differs from the header
    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Other(format!(
                "row has {} cells, dataset has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Column names in output order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// All rows.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Whether the dataset has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cells of column `name`, top to bottom.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<Option<&str>>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[idx].as_deref()).collect())
    }

    /// Arrow schema: one nullable Utf8 field per column.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|name| Field::new(name, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ))
    }

    /// Columnar view of the dataset.
    ///
    /// # Errors
    ///
    /// Returns error if the batch cannot be assembled
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let arrays: Vec<ArrayRef> = (0..self.columns.len())
            .map(|i| {
                Arc::new(
                    self.rows
                        .iter()
                        .map(|r| r[i].as_deref())
                        .collect::<StringArray>(),
                ) as ArrayRef
            })
            .collect();
        Ok(RecordBatch::try_new(self.schema(), arrays)?)
    }

    /// Rebuild a dataset from record batches. Non-string columns are cast
    /// to Utf8.
    ///
    /// # Errors
    ///
    /// Returns error if batches disagree on their schema or a column cannot
    /// be cast to text
    pub fn from_batches(schema: &Schema, batches: &[RecordBatch]) -> Result<Self> {
        let mut dataset = Self::new(schema.fields().iter().map(|f| f.name().clone()).collect());
        for batch in batches {
            if batch.num_columns() != dataset.columns.len() {
                return Err(Error::Other(format!(
                    "batch has {} columns, expected {}",
                    batch.num_columns(),
                    dataset.columns.len()
                )));
            }
            let columns = batch
                .columns()
                .iter()
                .map(|c| cast(c, &DataType::Utf8))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for row in 0..batch.num_rows() {
                dataset.rows.push(
                    columns
                        .iter()
                        .map(|c| {
                            let text = c.as_string::<i32>();
                            text.is_valid(row).then(|| text.value(row).to_string())
                        })
                        .collect(),
                );
            }
        }
        Ok(dataset)
    }

    /// Write as CSV with a header row. Null cells are written empty.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the atomic write fails
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let batch = self.to_record_batch()?;
        let mut writer = arrow::csv::WriterBuilder::new()
            .with_header(true)
            .build(Vec::new());
        writer.write(&batch)?;
        write_atomic(path.as_ref(), &writer.into_inner())
    }

    /// Write as a single-row-group Parquet file.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the atomic write fails
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use parquet::arrow::ArrowWriter;

        let batch = self.to_record_batch()?;
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        write_atomic(path.as_ref(), &buffer)
    }

    /// Load a dataset previously written with [`Self::write_parquet`].
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let file = File::open(path.as_ref())?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let reader = builder.build()?;

        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }
        Self::from_batches(&schema, &batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AggregatedDataset {
        let mut ds = AggregatedDataset::new(vec![
            UNIVERSE_ID_COLUMN.to_string(),
            dimension_column("scaler"),
            "score".to_string(),
        ]);
        ds.push_row(vec![
            Some("a".repeat(64)),
            Some("A".into()),
            Some("0.5".into()),
        ])
        .unwrap();
        ds.push_row(vec![Some("b".repeat(64)), Some("B".into()), None])
            .unwrap();
        ds
    }

    #[test]
    fn test_push_row_checks_width() {
        let mut ds = AggregatedDataset::new(vec!["a".into(), "b".into()]);
        assert!(ds.push_row(vec![None]).is_err());
        assert!(ds.push_row(vec![None, Some("x".into())]).is_ok());
        assert_eq!(ds.num_rows(), 1);
    }

    #[test]
    fn test_record_batch_shape() {
        let batch = sample().to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);
        assert_eq!(batch.schema().field(1).name(), "mv_dim_scaler");
        let score = batch.column(2).as_string::<i32>();
        assert_eq!(score.value(0), "0.5");
        assert!(score.is_null(1));
    }

    #[test]
    fn test_column_lookup() {
        let ds = sample();
        assert_eq!(ds.column("mv_dim_scaler").unwrap(), vec![Some("A"), Some("B")]);
        assert!(ds.column("missing").is_none());
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        sample().write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "mv_universe_id,mv_dim_scaler,score");
        assert!(lines.next().unwrap().ends_with(",A,0.5"));
        assert!(lines.next().unwrap().ends_with(",B,"));
    }

    #[test]
    fn test_parquet_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let ds = sample();
        ds.write_parquet(&path).unwrap();
        assert_eq!(AggregatedDataset::load_parquet(&path).unwrap(), ds);
    }

    #[test]
    fn test_load_parquet_missing_file() {
        assert!(AggregatedDataset::load_parquet("/nonexistent/file.parquet").is_err());
    }

    #[test]
    fn test_empty_dataset_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        AggregatedDataset::new(vec![UNIVERSE_ID_COLUMN.to_string()])
            .write_csv(&path)
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), UNIVERSE_ID_COLUMN);
    }
}
