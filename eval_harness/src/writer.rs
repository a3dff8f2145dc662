use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef};
use arrow::compute::concat;
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

const DEFAULT_BATCH_SIZE: usize = 1024;

/// Row-at-a-time parquet writer for per-example predictions.
pub struct ParquetWriter {
    path: PathBuf,
    schema: Arc<Schema>,
    writer: ArrowWriter<File>,
    batch_size: usize,
    columns: Vec<Vec<ArrayRef>>,
    rows: usize,
}

impl ParquetWriter {
    pub fn create(path: impl AsRef<Path>, schema: Schema) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("Failed to create file: {}", path.display()))?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let schema = Arc::new(schema);
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props))
            .context("Failed to create Arrow writer")?;

        Ok(Self {
            path,
            columns: vec![Vec::new(); schema.fields().len()],
            schema,
            writer,
            batch_size: DEFAULT_BATCH_SIZE,
            rows: 0,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Buffers one row, given as one single-element array per column.
    pub fn add_row(&mut self, row: Vec<ArrayRef>) -> Result<()> {
        if row.len() != self.columns.len() {
            anyhow::bail!(
                "Row has {} columns, schema has {}",
                row.len(),
                self.columns.len()
            );
        }
        for (column, array) in self.columns.iter_mut().zip(row) {
            column.push(array);
        }
        self.rows += 1;

        if self.columns[0].len() >= self.batch_size {
            self.write_batch()?;
        }
        Ok(())
    }

    fn write_batch(&mut self) -> Result<()> {
        if self.columns.first().map_or(true, Vec::is_empty) {
            return Ok(());
        }

        let arrays = self
            .columns
            .iter_mut()
            .map(|pending| {
                let parts: Vec<&dyn Array> = pending.iter().map(|a| a.as_ref()).collect();
                let array = concat(&parts);
                pending.clear();
                array
            })
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to concatenate rows")?;

        let batch = RecordBatch::try_new(self.schema.clone(), arrays)?;
        self.writer.write(&batch)?;
        Ok(())
    }

    /// Flushes buffered rows and closes the file, returning its path.
    pub fn close(mut self) -> Result<PathBuf> {
        self.write_batch()?;
        self.writer.close().context("Failed to close writer")?;
        Ok(self.path)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    #[test]
    fn test_parquet_writer() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("value", DataType::Utf8, false),
        ]);

        let path = temp_dir.path().join("test_predictions.parquet");
        let mut writer = ParquetWriter::create(&path, schema)?.with_batch_size(2);
        for i in 0..5 {
            writer.add_row(vec![
                Arc::new(Int64Array::from(vec![i as i64])),
                Arc::new(StringArray::from(vec![format!("value_{}", i)])),
            ])?;
        }
        assert_eq!(writer.rows(), 5);
        assert_eq!(writer.close()?, path);

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?.build()?;
        let mut values = Vec::new();
        for batch in reader {
            let batch = batch?;
            let column = batch
                .column(1)
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap();
            values.extend(column.iter().map(|v| v.unwrap().to_string()));
        }
        assert_eq!(values.len(), 5);
        assert_eq!(values[4], "value_4");
        Ok(())
    }

    #[test]
    fn rejects_rows_of_the_wrong_width() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let schema = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let mut writer = ParquetWriter::create(temp_dir.path().join("x.parquet"), schema)?;
        let row: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(Int64Array::from(vec![2])),
        ];
        assert!(writer.add_row(row).is_err());
        Ok(())
    }
}
