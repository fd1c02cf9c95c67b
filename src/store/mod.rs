//! Remote column-store interface
//!
//! The wide-column persistence backend is an external collaborator. The core
//! consumes it through the `ChunkSink` (write side) and `ChunkSource` (read
//! side) traits below; `src/store/memory.rs` provides the in-memory double
//! used by tests and single-node deployments.
//!
//! Layout contract: every chunk set lands in the chunk table under
//! `(partition, chunk_id)` and in the ingestion-time index under
//! `(partition, ingestion_time, start_time)`. A chunk set counts as written
//! only when both rows are durable.

mod memory;

pub use memory::{chunk_set_from_raw, InMemoryColumnStore};

use crate::chunk::{ChunkInfo, ChunkSet};
use crate::memstore::ColumnFilter;
use crate::schema::DatasetRef;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

/// User-time range for scans; both ends are millis, `end` inclusive unless
/// stated otherwise by the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

/// How a scan picks partitions
#[derive(Debug, Clone)]
pub enum PartitionScanMethod {
    /// Every partition of one shard
    AllShard(u32),
    /// Partitions of one shard matching label filters
    Filtered(u32, Vec<ColumnFilter>),
    /// Exactly one partition by key bytes
    Single(u32, Bytes),
    /// Multiple partitions by key bytes (multi-partition on-demand paging)
    Multi(u32, Vec<Bytes>),
}

impl PartitionScanMethod {
    /// Shard addressed by this scan
    pub fn shard(&self) -> u32 {
        match self {
            PartitionScanMethod::AllShard(s)
            | PartitionScanMethod::Filtered(s, _)
            | PartitionScanMethod::Single(s, _)
            | PartitionScanMethod::Multi(s, _) => *s,
        }
    }
}

/// How a scan picks chunks within each partition
#[derive(Debug, Clone, Copy)]
pub enum ChunkScanMethod {
    /// All persisted chunks
    All,
    /// Chunks overlapping the user-time range
    ByTime(TimeRange),
    /// Only what is memory-resident (no paging); memstore-side only
    InMemory,
}

/// One chunk set ready to persist: info, serialized columns, and the owning
/// partition key.
#[derive(Debug, Clone)]
pub struct ChunkSetRecord {
    pub dataset: DatasetRef,
    pub shard: u32,
    pub part_key: Bytes,
    pub info: ChunkInfo,
    pub columns: Bytes,
}

impl ChunkSetRecord {
    /// Build a record from a sealed chunk set.
    pub fn from_chunk_set(
        dataset: DatasetRef,
        shard: u32,
        part_key: Bytes,
        chunk_set: &ChunkSet,
    ) -> Self {
        Self {
            dataset,
            shard,
            part_key,
            info: chunk_set.info,
            columns: chunk_set.columns_blob(),
        }
    }
}

/// Raw chunk data for one chunk set read back from the store
#[derive(Debug, Clone)]
pub struct RawChunkSet {
    pub info: ChunkInfo,
    pub columns: Bytes,
}

/// Raw chunk data for one partition read back from the store
#[derive(Debug, Clone)]
pub struct RawPartData {
    pub part_key: Bytes,
    pub chunk_sets: Vec<RawChunkSet>,
}

/// A token-range split of the partition-key space, tagged with replica hosts
/// for locality-aware placement.
#[derive(Debug, Clone)]
pub struct ScanSplit {
    pub start_token: u64,
    pub end_token: u64,
    pub replicas: Vec<String>,
}

/// A partition-key record from the part-key table
#[derive(Debug, Clone)]
pub struct PartKeyRecord {
    pub part_key: Bytes,
    pub start_time: i64,
    /// `i64::MAX` means the series is still live and the row carries no TTL
    pub end_time: i64,
}

/// Write side of the remote column store
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Create tables for a dataset. Idempotent.
    async fn initialize(&self, dataset: &DatasetRef, num_shards: u32) -> Result<()>;

    /// Remove all rows for a dataset. Idempotent.
    async fn truncate(&self, dataset: &DatasetRef, num_shards: u32) -> Result<()>;

    /// Persist a stream of chunk sets under `ttl_seconds`. Returns the number
    /// of chunk sets whose chunk row AND index row both succeeded.
    async fn write(
        &self,
        dataset: &DatasetRef,
        chunk_sets: BoxStream<'_, ChunkSetRecord>,
        ttl_seconds: u64,
    ) -> Result<usize>;

    /// Persist partition-key records. Records with `end_time == i64::MAX` are
    /// written without TTL.
    async fn write_part_keys(
        &self,
        dataset: &DatasetRef,
        shard: u32,
        records: BoxStream<'_, PartKeyRecord>,
        ttl_seconds: u64,
    ) -> Result<usize>;
}

/// Read side of the remote column store
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Read raw partitions matching the scan spec. Chunks whose range
    /// intersects `[start - max_chunk_time, end]` are included so the chunk
    /// containing the earliest relevant sample is never missed.
    async fn read_raw_partitions(
        &self,
        dataset: &DatasetRef,
        max_chunk_time: i64,
        part_method: PartitionScanMethod,
        chunk_method: ChunkScanMethod,
    ) -> Result<BoxStream<'static, Result<RawPartData>>>;

    /// Scan by ingestion-time index for downsampling and repair. `ing_end`
    /// and `user_end` are exclusive. Partitions are emitted in batches of at
    /// most `batch_size`.
    #[allow(clippy::too_many_arguments)]
    async fn chunks_by_ingestion_time_range(
        &self,
        dataset: &DatasetRef,
        splits: Vec<ScanSplit>,
        ing_start: i64,
        ing_end: i64,
        user_start: i64,
        user_end: i64,
        max_chunk_time: i64,
        batch_size: usize,
    ) -> Result<BoxStream<'static, Result<Vec<RawPartData>>>>;

    /// Disjoint token-range splits covering the key space.
    async fn scan_splits(&self, dataset: &DatasetRef, splits_per_node: usize)
        -> Result<Vec<ScanSplit>>;

    /// Stream all part-key records of a shard, for index rebuild.
    async fn scan_part_keys(
        &self,
        dataset: &DatasetRef,
        shard: u32,
    ) -> Result<BoxStream<'static, Result<PartKeyRecord>>>;
}

/// Convenience alias for a sink+source handle
pub trait ColumnStore: ChunkSink + ChunkSource {}
impl<T: ChunkSink + ChunkSource> ColumnStore for T {}

/// Shared handle to a column store
pub type ColumnStoreRef = Arc<dyn ColumnStore>;
