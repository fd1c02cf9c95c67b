//! Time-series partition: the in-memory residency of one series on one shard
//!
//! A partition holds at most one set of mutable write buffers plus an ordered
//! list of sealed chunk sets. Ingest appends to the buffers under a strict
//! timestamp-monotonicity rule; `switch_buffers` seals them into a chunk set
//! that becomes atomically visible to readers. Write-buffer lifecycle:
//! Empty → Filling → Sealed → Encoded → Persisted → Evictable.

use crate::chunk::{
    BlockMemoryManager, ChunkId, ChunkInfo, ChunkSet, ChunkSetReader, ColumnBuffer, DoubleEncoder,
    HistogramEncoder, TimestampEncoder, WriteBufferPool, WriteBuffers,
};
use crate::schema::{DatasetRef, FieldValue, HistogramValue, Schema};
use crate::store::TimeRange;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

struct ChunkHolder {
    set: Arc<ChunkSet>,
    persisted: bool,
}

#[derive(Default)]
struct PartitionState {
    buffers: Option<WriteBuffers>,
    /// Sealed chunk sets ordered by start time
    chunks: Vec<ChunkHolder>,
}

/// One series' residency on one shard
pub struct TimeSeriesPartition {
    part_id: u32,
    part_key: Bytes,
    dataset: DatasetRef,
    shard: u32,
    schema: Arc<Schema>,
    pool: Arc<WriteBufferPool>,
    blocks: Arc<BlockMemoryManager>,
    state: RwLock<PartitionState>,
    last_ingested: AtomicI64,
    last_queried: AtomicI64,
    chunk_seq: AtomicU32,
    evicted: AtomicBool,
    /// Latest end time among chunks dropped from memory; reads starting at or
    /// before this must page from the remote store
    evicted_before: AtomicI64,
    flush_listener: Mutex<Option<oneshot::Sender<()>>>,
}

impl TimeSeriesPartition {
    pub fn new(
        part_id: u32,
        part_key: Bytes,
        dataset: DatasetRef,
        shard: u32,
        schema: Arc<Schema>,
        pool: Arc<WriteBufferPool>,
        blocks: Arc<BlockMemoryManager>,
    ) -> Self {
        Self {
            part_id,
            part_key,
            dataset,
            shard,
            schema,
            pool,
            blocks,
            state: RwLock::new(PartitionState::default()),
            last_ingested: AtomicI64::new(i64::MIN),
            last_queried: AtomicI64::new(i64::MIN),
            chunk_seq: AtomicU32::new(0),
            evicted: AtomicBool::new(false),
            evicted_before: AtomicI64::new(i64::MIN),
            flush_listener: Mutex::new(None),
        }
    }

    pub fn part_id(&self) -> u32 {
        self.part_id
    }

    pub fn part_key(&self) -> &Bytes {
        &self.part_key
    }

    pub fn dataset(&self) -> &DatasetRef {
        &self.dataset
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Timestamp of the most recent sample, or `i64::MIN` when empty
    pub fn last_ingested(&self) -> i64 {
        self.last_ingested.load(Ordering::Acquire)
    }

    /// Last time a query touched this partition (for eviction recency)
    pub fn last_queried(&self) -> i64 {
        self.last_queried.load(Ordering::Acquire)
    }

    /// Append one row. Timestamps must strictly increase; violations are
    /// rejected with `OutOfOrderSample` and leave the partition unchanged.
    pub fn ingest(&self, ts: i64, values: &[FieldValue], ingestion_time: i64) -> Result<()> {
        let last = self.last_ingested.load(Ordering::Acquire);
        if ts <= last {
            return Err(Error::OutOfOrderSample { got: ts, last });
        }

        let mut state = self.state.write();

        // A histogram bucket-scheme change forces the current buffers to seal
        // so the new scheme starts a fresh chunk.
        let scheme_change = match &state.buffers {
            Some(buffers) => values.iter().enumerate().any(|(ix, v)| match v {
                FieldValue::Histogram(h) => !buffers.accepts_histogram(ix, h),
                _ => false,
            }),
            None => false,
        };
        if scheme_change {
            self.seal_locked(&mut state, true, ingestion_time)?;
        }
        if state.buffers.is_none() {
            state.buffers = Some(self.pool.try_acquire()?);
        }

        let mut full = false;
        if let Some(buffers) = state.buffers.as_mut() {
            append_row(buffers, ts, values)?;
            full = buffers.num_rows() >= self.pool.rows_per_buffer();
        }
        self.last_ingested.store(ts, Ordering::Release);
        self.evicted.store(false, Ordering::Release);

        if full {
            self.seal_locked(&mut state, true, ingestion_time)?;
        }
        Ok(())
    }

    /// Seal the current write buffers into a chunk set. With `encode` the
    /// columns move into block memory; the chunk set becomes reader-visible
    /// atomically on return. Safe to call concurrently with reads.
    pub fn switch_buffers(&self, encode: bool, ingestion_time: i64) -> Result<Option<Arc<ChunkSet>>> {
        let mut state = self.state.write();
        self.seal_locked(&mut state, encode, ingestion_time)
    }

    fn seal_locked(
        &self,
        state: &mut PartitionState,
        encode: bool,
        ingestion_time: i64,
    ) -> Result<Option<Arc<ChunkSet>>> {
        let Some(buffers) = state.buffers.take() else {
            return Ok(None);
        };
        if buffers.is_empty() {
            self.pool.release(buffers);
            return Ok(None);
        }

        let encoded = encode_buffers(&buffers)?;
        let start_time = buffers.timestamps[0];
        let end_time = *buffers.timestamps.last().expect("non-empty buffers");
        let num_rows = buffers.num_rows() as u32;

        let column_refs: Vec<&[u8]> = encoded.iter().map(|b| &b[..]).collect();
        let (columns, guard) = if encode {
            match self.blocks.seal(&column_refs) {
                Ok((slices, guard)) => (slices, Some(guard)),
                Err(e) => {
                    // Budget exhausted: keep the buffers so ingest can retry
                    // after eviction frees blocks.
                    state.buffers = Some(buffers);
                    return Err(e);
                }
            }
        } else {
            (encoded, None)
        };

        let seq = self.chunk_seq.fetch_add(1, Ordering::AcqRel);
        let info = ChunkInfo {
            id: ChunkId::new(start_time, seq),
            start_time,
            end_time,
            ingestion_time,
            num_rows,
        };
        let set = Arc::new(ChunkSet::new(info, columns, guard));
        state.chunks.push(ChunkHolder {
            set: set.clone(),
            persisted: false,
        });
        self.pool.release(buffers);
        Ok(Some(set))
    }

    /// Immutable view of chunks and buffered rows for a query. The caller
    /// biases `range.start` by the max chunk length so the chunk containing
    /// the earliest relevant sample is included.
    pub fn snapshot(&self, range: TimeRange, query_time: i64) -> PartitionSnapshot {
        self.last_queried.fetch_max(query_time, Ordering::AcqRel);
        let state = self.state.read();
        let chunks: Vec<Arc<ChunkSet>> = state
            .chunks
            .iter()
            .filter(|h| h.set.info.intersects(range.start, range.end))
            .map(|h| h.set.clone())
            .collect();
        let buffer = state.buffers.as_ref().and_then(|b| {
            if b.is_empty() {
                return None;
            }
            Some(BufferData {
                timestamps: b.timestamps.clone(),
                columns: b
                    .columns
                    .iter()
                    .map(|c| match c {
                        ColumnBuffer::Double(v) => ColumnData::Double(v.clone()),
                        ColumnBuffer::Histogram(v) => ColumnData::Histogram(v.clone()),
                    })
                    .collect(),
            })
        });
        PartitionSnapshot {
            part_key: self.part_key.clone(),
            schema: self.schema.clone(),
            chunks,
            buffer,
        }
    }

    /// True when the range reaches data this partition no longer holds in
    /// memory (triggers on-demand paging).
    pub fn needs_paging(&self, range: TimeRange) -> bool {
        if self.evicted.load(Ordering::Acquire) {
            return true;
        }
        let frontier = self.evicted_before.load(Ordering::Acquire);
        frontier != i64::MIN && range.start <= frontier
    }

    /// Chunk sets not yet acknowledged by the remote store
    pub fn unpersisted_chunks(&self) -> Vec<Arc<ChunkSet>> {
        self.state
            .read()
            .chunks
            .iter()
            .filter(|h| !h.persisted)
            .map(|h| h.set.clone())
            .collect()
    }

    /// Whether any data (buffered or sealed) awaits persistence
    pub fn is_dirty(&self) -> bool {
        let state = self.state.read();
        state.buffers.as_ref().map(|b| !b.is_empty()).unwrap_or(false)
            || state.chunks.iter().any(|h| !h.persisted)
    }

    /// Mark chunk sets as persisted and fire the flush listener.
    pub fn mark_persisted(&self, ids: &[ChunkId]) {
        {
            let mut state = self.state.write();
            for holder in state.chunks.iter_mut() {
                if ids.contains(&holder.set.info.id) {
                    holder.persisted = true;
                }
            }
        }
        self.invoke_flush_listener();
    }

    /// Register a single-shot callback fired when the next persistence write
    /// succeeds. Used for ingest backpressure.
    pub fn set_flush_listener(&self, listener: oneshot::Sender<()>) {
        *self.flush_listener.lock() = Some(listener);
    }

    /// Fire and clear the flush listener, if any.
    pub fn invoke_flush_listener(&self) {
        if let Some(tx) = self.flush_listener.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Drop the oldest persisted chunk sets beyond `keep`. Unpersisted chunks
    /// are never dropped.
    pub fn trim_chunks(&self, keep: usize) {
        let mut state = self.state.write();
        while state.chunks.len() > keep {
            match state.chunks.iter().position(|h| h.persisted) {
                Some(ix) if ix == 0 => {
                    let dropped = state.chunks.remove(0);
                    self.evicted_before
                        .fetch_max(dropped.set.info.end_time, Ordering::AcqRel);
                }
                _ => break, // oldest chunk unpersisted; nothing safe to drop
            }
        }
    }

    /// Drop the whole chunk list, leaving an index stub. Refuses while dirty.
    /// Returns whether the partition was evicted.
    pub fn evict(&self) -> bool {
        let mut state = self.state.write();
        let dirty = state.buffers.as_ref().map(|b| !b.is_empty()).unwrap_or(false)
            || state.chunks.iter().any(|h| !h.persisted);
        if dirty {
            return false;
        }
        if let Some(buffers) = state.buffers.take() {
            self.pool.release(buffers);
        }
        for holder in state.chunks.drain(..) {
            self.evicted_before
                .fetch_max(holder.set.info.end_time, Ordering::AcqRel);
        }
        self.evicted.store(true, Ordering::Release);
        true
    }

    /// Whether the partition is an evicted stub
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Install chunk sets paged back from the remote store. Already-resident
    /// chunk ids are skipped; ordering by start time is restored.
    pub fn install_paged(&self, chunk_sets: Vec<ChunkSet>) {
        let mut state = self.state.write();
        for set in chunk_sets {
            if state.chunks.iter().any(|h| h.set.info.id == set.info.id) {
                continue;
            }
            state.chunks.push(ChunkHolder {
                set: Arc::new(set),
                persisted: true,
            });
        }
        state
            .chunks
            .sort_by_key(|h| (h.set.info.start_time, h.set.info.id));
        self.evicted.store(false, Ordering::Release);
    }

    /// Number of memory-resident chunk sets
    pub fn num_chunks(&self) -> usize {
        self.state.read().chunks.len()
    }
}

fn append_row(buffers: &mut WriteBuffers, ts: i64, values: &[FieldValue]) -> Result<()> {
    if values.len() != buffers.columns.len() {
        return Err(Error::SchemaMismatch(format!(
            "expected {} values, got {}",
            buffers.columns.len(),
            values.len()
        )));
    }
    for (col, value) in buffers.columns.iter_mut().zip(values) {
        match (col, value) {
            (ColumnBuffer::Double(buf), FieldValue::Double(v)) => buf.push(*v),
            (ColumnBuffer::Histogram(buf), FieldValue::Histogram(h)) => buf.push(h.clone()),
            _ => {
                return Err(Error::SchemaMismatch(
                    "value kind does not match column buffer".into(),
                ))
            }
        }
    }
    buffers.timestamps.push(ts);
    Ok(())
}

fn encode_buffers(buffers: &WriteBuffers) -> Result<Vec<Bytes>> {
    let mut encoded = Vec::with_capacity(buffers.columns.len() + 1);
    let mut ts_enc = TimestampEncoder::new();
    for &ts in &buffers.timestamps {
        ts_enc.append(ts);
    }
    encoded.push(ts_enc.encode());
    for col in &buffers.columns {
        match col {
            ColumnBuffer::Double(values) => {
                let mut enc = DoubleEncoder::new();
                for &v in values {
                    enc.append(v);
                }
                encoded.push(enc.encode());
            }
            ColumnBuffer::Histogram(values) => {
                let mut enc = HistogramEncoder::new();
                for h in values {
                    enc.append(h)?;
                }
                encoded.push(enc.encode());
            }
        }
    }
    Ok(encoded)
}

/// Cloned column data from unsealed write buffers
#[derive(Debug, Clone)]
pub enum ColumnData {
    Double(Vec<f64>),
    Histogram(Vec<HistogramValue>),
}

/// Snapshot of a partition's buffered rows
#[derive(Debug, Clone)]
pub struct BufferData {
    pub timestamps: Vec<i64>,
    pub columns: Vec<ColumnData>,
}

/// Immutable read view over one partition
pub struct PartitionSnapshot {
    pub part_key: Bytes,
    pub schema: Arc<Schema>,
    /// Sealed chunk sets intersecting the query range, time-ordered
    pub chunks: Vec<Arc<ChunkSet>>,
    /// Unsealed buffer rows, if any
    pub buffer: Option<BufferData>,
}

impl PartitionSnapshot {
    /// Readers over the sealed chunks
    pub fn chunk_readers(&self) -> Vec<ChunkSetReader> {
        self.chunks
            .iter()
            .map(|set| ChunkSetReader::new(set.clone(), self.schema.clone()))
            .collect()
    }

    /// Double samples for `column_id` within `range`, inclusive, across
    /// sealed chunks and the write buffer, in timestamp order.
    pub fn double_samples(&self, column_id: u16, range: TimeRange) -> Result<Vec<(i64, f64)>> {
        let mut out = Vec::new();
        for reader in self.chunk_readers() {
            let timestamps = reader.timestamps()?;
            let doubles = reader.doubles(column_id)?;
            for (row, ts) in timestamps.iterate(0).enumerate() {
                if range.contains(ts) {
                    out.push((ts, doubles.apply(row)));
                }
            }
        }
        if let Some(buffer) = &self.buffer {
            let col_ix = self.buffer_column_index(column_id)?;
            if let ColumnData::Double(values) = &buffer.columns[col_ix] {
                for (ts, v) in buffer.timestamps.iter().zip(values) {
                    if range.contains(*ts) {
                        out.push((*ts, *v));
                    }
                }
            } else {
                return Err(Error::SchemaMismatch(format!(
                    "column id {column_id} is not a double column"
                )));
            }
        }
        Ok(out)
    }

    /// Histogram samples for `column_id` within `range`, inclusive.
    pub fn histogram_samples(
        &self,
        column_id: u16,
        range: TimeRange,
    ) -> Result<Vec<(i64, HistogramValue)>> {
        let mut out = Vec::new();
        for reader in self.chunk_readers() {
            let timestamps = reader.timestamps()?;
            let hists = reader.histograms(column_id)?;
            for (row, ts) in timestamps.iterate(0).enumerate() {
                if range.contains(ts) {
                    out.push((ts, hists.apply(row)));
                }
            }
        }
        if let Some(buffer) = &self.buffer {
            let col_ix = self.buffer_column_index(column_id)?;
            if let ColumnData::Histogram(values) = &buffer.columns[col_ix] {
                for (ts, h) in buffer.timestamps.iter().zip(values) {
                    if range.contains(*ts) {
                        out.push((*ts, h.clone()));
                    }
                }
            } else {
                return Err(Error::SchemaMismatch(format!(
                    "column id {column_id} is not a histogram column"
                )));
            }
        }
        Ok(out)
    }

    fn buffer_column_index(&self, column_id: u16) -> Result<usize> {
        self.schema
            .data_columns()
            .iter()
            .position(|c| c.id == column_id)
            .ok_or_else(|| Error::UndefinedColumn(format!("column id {column_id}")))
    }
}
