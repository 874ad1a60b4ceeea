//! Output columns written one sample row at a time.
//!
//! A writer must see `close()` exactly once after its last row. Two columns
//! that must appear together are first `prepare()`d, then closed. A run that
//! fails calls `abort()` instead, which discards the column even if it was
//! already closed.

use crate::error::{RenormError, Result};
use crate::store::{column_path, register_column, unregister_column};
use log::{debug, warn};
use ndarray::{Array1, ArrayView1};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait RowWriter {
    /// Appends one sample's row. Rows are persisted in call order.
    fn write(&mut self, row: ArrayView1<f64>) -> Result<()>;

    /// Makes every written row durable without publishing the column.
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flushes and publishes the column.
    fn close(&mut self) -> Result<()>;

    /// Discards the column, including a closed one.
    fn abort(&mut self) -> Result<()>;

    fn rows_written(&self) -> usize;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
    Aborted,
}

/// File-backed column that buffers `batch_rows` rows before each write.
///
/// Rows go to `<name>.f32.partial` and only appear as `<name>.f32` on close.
pub struct BatchTableWriter {
    name: String,
    root: PathBuf,
    final_path: PathBuf,
    partial_path: PathBuf,
    file: Option<File>,
    snp_count: usize,
    batch_rows: usize,
    batch: Vec<u8>,
    rows: usize,
    state: WriterState,
}

impl BatchTableWriter {
    pub fn create(root: &Path, name: &str, snp_count: usize, batch_rows: usize) -> Result<Self> {
        let final_path = column_path(root, name, "f32");
        let partial_path = column_path(root, name, "f32.partial");
        let file = File::create(&partial_path)?;
        let batch_rows = batch_rows.max(1);
        debug!(
            "Opened output column {} ({} SNPs, {} rows per batch).",
            name, snp_count, batch_rows
        );
        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            final_path,
            partial_path,
            file: Some(file),
            snp_count,
            batch_rows,
            batch: Vec::with_capacity(batch_rows * snp_count * 4),
            rows: 0,
            state: WriterState::Open,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| RenormError::WriterClosed(self.name.clone()))?;
        file.write_all(&self.batch)?;
        self.batch.clear();
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl RowWriter for BatchTableWriter {
    fn write(&mut self, row: ArrayView1<f64>) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(RenormError::WriterClosed(self.name.clone()));
        }
        if row.len() != self.snp_count {
            return Err(RenormError::invalid_data(format!(
                "Row {} of column {} has {} values, expected {}",
                self.rows,
                self.name,
                row.len(),
                self.snp_count
            )));
        }
        for &v in row.iter() {
            self.batch.extend_from_slice(&(v as f32).to_le_bytes());
        }
        self.rows += 1;
        if self.rows % self.batch_rows == 0 {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(RenormError::WriterClosed(self.name.clone()));
        }
        self.flush_batch()?;
        if let Some(file) = self.file.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.prepare()?;
        self.file = None;
        fs::rename(&self.partial_path, &self.final_path)?;
        self.state = WriterState::Closed;
        register_column(&self.root, &self.name)?;
        debug!("Closed output column {} with {} rows.", self.name, self.rows);
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        match self.state {
            WriterState::Aborted => Ok(()),
            WriterState::Open => {
                self.file = None;
                self.batch.clear();
                self.state = WriterState::Aborted;
                remove_if_present(&self.partial_path)
            }
            WriterState::Closed => {
                self.state = WriterState::Aborted;
                remove_if_present(&self.final_path)?;
                unregister_column(&self.root, &self.name)?;
                debug!("Withdrew closed output column {}.", self.name);
                Ok(())
            }
        }
    }

    fn rows_written(&self) -> usize {
        self.rows
    }
}

impl Drop for BatchTableWriter {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            if let Err(e) = self.abort() {
                warn!("Failed to discard unfinished column {}: {}", self.name, e);
            }
        }
    }
}

/// Collects rows in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    rows: Vec<Array1<f64>>,
    closed: bool,
    aborted: bool,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[Array1<f64>] {
        &self.rows
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

impl RowWriter for MemoryWriter {
    fn write(&mut self, row: ArrayView1<f64>) -> Result<()> {
        if self.closed || self.aborted {
            return Err(RenormError::WriterClosed("memory".to_string()));
        }
        self.rows.push(row.to_owned());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed || self.aborted {
            return Err(RenormError::WriterClosed("memory".to_string()));
        }
        self.closed = true;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.rows.clear();
        self.closed = false;
        self.aborted = true;
        Ok(())
    }

    fn rows_written(&self) -> usize {
        self.rows.len()
    }
}

/// Reads a closed `.f32` output column back as `rows x snp_count` values.
pub fn read_column(root: &Path, name: &str, snp_count: usize) -> Result<Vec<Array1<f64>>> {
    let bytes = fs::read(column_path(root, name, "f32"))?;
    let row_bytes = snp_count * 4;
    if row_bytes == 0 || bytes.len() % row_bytes != 0 {
        return Err(RenormError::invalid_data(format!(
            "Column {} holds {} bytes, not a whole number of {}-SNP rows",
            name,
            bytes.len(),
            snp_count
        )));
    }
    Ok(bytes
        .chunks_exact(row_bytes)
        .map(|row| {
            row.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GdatStore, IntensityStore, StoreBuilder};
    use ndarray::array;
    use tempfile::tempdir;

    fn empty_store(dir: &Path) {
        StoreBuilder::create(dir, 2, false).unwrap().finish().unwrap();
    }

    #[test]
    fn rows_persist_in_order_across_batches() {
        let dir = tempdir().unwrap();
        empty_store(dir.path());
        let mut writer = BatchTableWriter::create(dir.path(), "LRR_QN", 2, 2).unwrap();
        writer.write(array![0.1, 0.2].view()).unwrap();
        writer.write(array![f64::NAN, f64::NAN].view()).unwrap();
        writer.write(array![-1.5, 3.0].view()).unwrap();
        assert_eq!(writer.rows_written(), 3);
        assert!(!column_path(dir.path(), "LRR_QN", "f32").exists());
        writer.close().unwrap();

        let rows = read_column(dir.path(), "LRR_QN", 2).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][1], 0.2f32 as f64);
        assert!(rows[1].iter().all(|v| v.is_nan()));
        assert_eq!(rows[2], array![-1.5, 3.0]);
        assert!(!column_path(dir.path(), "LRR_QN", "f32.partial").exists());
    }

    #[test]
    fn writing_after_close_fails() {
        let dir = tempdir().unwrap();
        empty_store(dir.path());
        let mut writer = BatchTableWriter::create(dir.path(), "BAF_QN", 2, 8).unwrap();
        writer.close().unwrap();
        let err = writer.write(array![0.0, 1.0].view()).unwrap_err();
        assert!(matches!(err, RenormError::WriterClosed(_)));
        assert!(writer.close().is_err());
    }

    #[test]
    fn abort_and_drop_leave_no_partial_column() {
        let dir = tempdir().unwrap();
        empty_store(dir.path());
        let mut writer = BatchTableWriter::create(dir.path(), "LRR_QN", 2, 1).unwrap();
        writer.write(array![0.5, 0.5].view()).unwrap();
        writer.abort().unwrap();
        assert!(!column_path(dir.path(), "LRR_QN", "f32.partial").exists());
        assert!(!column_path(dir.path(), "LRR_QN", "f32").exists());

        {
            let mut dropped = BatchTableWriter::create(dir.path(), "BAF_QN", 2, 1).unwrap();
            dropped.write(array![0.5, 0.5].view()).unwrap();
        }
        assert!(!column_path(dir.path(), "BAF_QN", "f32.partial").exists());
        assert!(!column_path(dir.path(), "BAF_QN", "f32").exists());
    }

    #[test]
    fn prepare_persists_rows_without_publishing() {
        let dir = tempdir().unwrap();
        empty_store(dir.path());
        let mut writer = BatchTableWriter::create(dir.path(), "LRR_QN", 2, 16).unwrap();
        writer.write(array![0.25, 0.75].view()).unwrap();
        writer.prepare().unwrap();
        let partial = column_path(dir.path(), "LRR_QN", "f32.partial");
        assert_eq!(fs::metadata(&partial).unwrap().len(), 8);
        assert!(!column_path(dir.path(), "LRR_QN", "f32").exists());

        writer.close().unwrap();
        assert_eq!(read_column(dir.path(), "LRR_QN", 2).unwrap().len(), 1);
    }

    #[test]
    fn abort_after_close_withdraws_the_column() {
        let dir = tempdir().unwrap();
        empty_store(dir.path());
        let mut kept = BatchTableWriter::create(dir.path(), "BAF_QN", 2, 1).unwrap();
        kept.write(array![0.0, 1.0].view()).unwrap();
        kept.close().unwrap();
        let mut withdrawn = BatchTableWriter::create(dir.path(), "LRR_QN", 2, 1).unwrap();
        withdrawn.write(array![0.1, 0.2].view()).unwrap();
        withdrawn.close().unwrap();

        withdrawn.abort().unwrap();
        assert!(!column_path(dir.path(), "LRR_QN", "f32").exists());
        let store = GdatStore::open(dir.path()).unwrap();
        assert_eq!(store.attribute("columns").as_deref(), Some(r#"["BAF_QN"]"#));
    }

    #[test]
    fn wrong_row_length_is_rejected() {
        let dir = tempdir().unwrap();
        empty_store(dir.path());
        let mut writer = BatchTableWriter::create(dir.path(), "LRR_QN", 2, 1).unwrap();
        assert!(writer.write(array![1.0].view()).is_err());
        assert_eq!(writer.rows_written(), 0);
    }

    #[test]
    fn memory_writer_follows_the_same_lifecycle() {
        let mut writer = MemoryWriter::new();
        writer.write(array![1.0].view()).unwrap();
        writer.write(array![2.0].view()).unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert_eq!(writer.rows_written(), 2);
        assert!(writer.write(array![3.0].view()).is_err());

        let mut aborted = MemoryWriter::new();
        aborted.write(array![1.0].view()).unwrap();
        aborted.abort().unwrap();
        assert!(aborted.is_aborted());
        assert!(aborted.rows().is_empty());
    }
}
