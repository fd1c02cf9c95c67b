//! Recyclable write-buffer pool
//!
//! Each shard owns a fixed-capacity pool of pre-sized write buffers. A
//! partition acquires a buffer set when its first sample arrives and returns
//! it when the buffers seal into a chunk. An empty pool is the ingest
//! backpressure signal: callers either fail fast with
//! `Error::BufferPoolExhausted` or await a release.

use crate::schema::{ColumnType, HistogramValue, Schema};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Mutable column buffer for one value column
#[derive(Debug)]
pub enum ColumnBuffer {
    Double(Vec<f64>),
    Histogram(Vec<HistogramValue>),
}

impl ColumnBuffer {
    fn clear(&mut self) {
        match self {
            ColumnBuffer::Double(v) => v.clear(),
            ColumnBuffer::Histogram(v) => v.clear(),
        }
    }
}

/// One partition's mutable buffers: timestamps plus every value column
#[derive(Debug)]
pub struct WriteBuffers {
    pub timestamps: Vec<i64>,
    pub columns: Vec<ColumnBuffer>,
}

impl WriteBuffers {
    fn for_schema(schema: &Schema, rows: usize) -> Result<Self> {
        let mut columns = Vec::with_capacity(schema.data_columns().len());
        for col in schema.data_columns() {
            columns.push(match col.column_type {
                ColumnType::Double => ColumnBuffer::Double(Vec::with_capacity(rows)),
                ColumnType::Histogram => ColumnBuffer::Histogram(Vec::with_capacity(rows)),
                other => {
                    return Err(Error::SchemaMismatch(format!(
                        "column {} has type {other:?}, not supported in write buffers",
                        col.name
                    )))
                }
            });
        }
        Ok(Self {
            timestamps: Vec::with_capacity(rows),
            columns,
        })
    }

    /// Rows currently buffered
    pub fn num_rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Whether a histogram can append to column index `col_ix` without a
    /// bucket-scheme change.
    pub fn accepts_histogram(&self, col_ix: usize, value: &HistogramValue) -> bool {
        match &self.columns[col_ix] {
            ColumnBuffer::Histogram(rows) => rows
                .first()
                .map(|first| *first.bounds == *value.bounds)
                .unwrap_or(true),
            _ => false,
        }
    }

    fn clear(&mut self) {
        self.timestamps.clear();
        for col in &mut self.columns {
            col.clear();
        }
    }
}

/// Fixed-capacity pool of write-buffer sets for one shard
#[derive(Debug)]
pub struct WriteBufferPool {
    schema: Arc<Schema>,
    rows_per_buffer: usize,
    capacity: usize,
    free: Mutex<Vec<WriteBuffers>>,
    released: Notify,
}

impl WriteBufferPool {
    /// Pre-allocate `capacity` buffer sets sized for `rows_per_buffer` rows.
    pub fn new(schema: Arc<Schema>, rows_per_buffer: usize, capacity: usize) -> Result<Self> {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(WriteBuffers::for_schema(&schema, rows_per_buffer)?);
        }
        Ok(Self {
            schema,
            rows_per_buffer,
            capacity,
            free: Mutex::new(free),
            released: Notify::new(),
        })
    }

    /// Buffer sets currently free
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Total buffer sets owned by the pool
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows each buffer set holds before it must seal
    pub fn rows_per_buffer(&self) -> usize {
        self.rows_per_buffer
    }

    /// Take a buffer set, failing fast when the pool is empty.
    pub fn try_acquire(&self) -> Result<WriteBuffers> {
        self.free.lock().pop().ok_or(Error::BufferPoolExhausted)
    }

    /// Take a buffer set, awaiting a release when the pool is empty.
    pub async fn acquire(&self) -> WriteBuffers {
        loop {
            let notified = self.released.notified();
            if let Some(buffers) = self.free.lock().pop() {
                return buffers;
            }
            notified.await;
        }
    }

    /// Return a buffer set to the pool, cleared for reuse.
    pub fn release(&self, mut buffers: WriteBuffers) {
        buffers.clear();
        self.free.lock().push(buffers);
        self.released.notify_one();
    }

    /// The schema buffers are shaped for
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_recycles() {
        let pool = WriteBufferPool::new(Schema::prom_gauge(), 100, 2).unwrap();
        assert_eq!(pool.available(), 2);
        let mut a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(matches!(pool.try_acquire(), Err(Error::BufferPoolExhausted)));

        a.timestamps.push(1);
        if let ColumnBuffer::Double(v) = &mut a.columns[0] {
            v.push(1.0);
        }
        pool.release(a);
        let again = pool.try_acquire().unwrap();
        assert!(again.is_empty(), "released buffers come back cleared");
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let pool = Arc::new(WriteBufferPool::new(Schema::prom_gauge(), 10, 1).unwrap());
        let held = pool.try_acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::task::yield_now().await;
        pool.release(held);
        let buffers = waiter.await.unwrap();
        assert!(buffers.is_empty());
    }

    #[test]
    fn histogram_scheme_check() {
        let pool = WriteBufferPool::new(Schema::prom_histogram(), 10, 1).unwrap();
        let mut buffers = pool.try_acquire().unwrap();
        let bounds_a = Arc::new(vec![10.0, f64::INFINITY]);
        let bounds_b = Arc::new(vec![10.0, 50.0, f64::INFINITY]);
        let h_a = HistogramValue::new(bounds_a, vec![1.0, 2.0]);
        let h_b = HistogramValue::new(bounds_b, vec![1.0, 2.0, 3.0]);

        assert!(buffers.accepts_histogram(0, &h_a));
        if let ColumnBuffer::Histogram(rows) = &mut buffers.columns[0] {
            rows.push(h_a.clone());
        }
        assert!(buffers.accepts_histogram(0, &h_a));
        assert!(!buffers.accepts_histogram(0, &h_b));
    }
}
