//! Time-series shard
//!
//! A shard owns a contiguous slice of the partition-key hash space: its
//! partition directory, the inverted label index, the write-buffer pool, the
//! block memory budget, and the staggered flush schedule. Ingest is
//! single-writer; reads are concurrent.

use super::index::{ColumnFilter, IndexSnapshot, PartKeyIndex};
use super::partition::{PartitionSnapshot, TimeSeriesPartition};
use crate::chunk::{BlockMemoryManager, WriteBufferPool};
use crate::clock::IngestionClock;
use crate::config::Settings;
use crate::schema::{Dataset, PartitionKey, RecordContainer};
use crate::store::{
    ChunkScanMethod, ChunkSetRecord, ColumnStoreRef, PartKeyRecord, PartitionScanMethod, TimeRange,
};
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of ingesting one record container
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestStats {
    pub rows_ingested: usize,
    pub out_of_order_dropped: usize,
    pub schema_mismatch_dropped: usize,
}

/// Point-in-time shard statistics
#[derive(Debug, Clone)]
pub struct ShardStats {
    pub num_partitions: usize,
    pub resident_partitions: usize,
    pub samples_ingested: u64,
    pub out_of_order_dropped: u64,
    pub schema_mismatch_dropped: u64,
    pub flushes_completed: u64,
    pub flush_failures: u64,
    pub partitions_evicted: u64,
    pub odp_reads: u64,
    pub block_memory_used: usize,
    pub buffers_available: usize,
}

#[derive(Default)]
struct Counters {
    samples_ingested: AtomicU64,
    out_of_order_dropped: AtomicU64,
    schema_mismatch_dropped: AtomicU64,
    flushes_completed: AtomicU64,
    flush_failures: AtomicU64,
    partitions_evicted: AtomicU64,
    odp_reads: AtomicU64,
}

/// One shard of a dataset
pub struct TimeSeriesShard {
    dataset: Arc<Dataset>,
    shard_num: u32,
    num_shards: u32,
    settings: Arc<Settings>,
    store: ColumnStoreRef,
    clock: Arc<IngestionClock>,
    partitions: DashMap<Bytes, Arc<TimeSeriesPartition>>,
    by_part_id: DashMap<u32, Arc<TimeSeriesPartition>>,
    next_part_id: AtomicU32,
    index: PartKeyIndex,
    pool: Arc<WriteBufferPool>,
    blocks: Arc<BlockMemoryManager>,
    /// Part-key records created since the last flush
    new_part_keys: Mutex<Vec<PartKeyRecord>>,
    next_flush_group: AtomicUsize,
    counters: Counters,
}

impl TimeSeriesShard {
    pub fn new(
        dataset: Arc<Dataset>,
        shard_num: u32,
        num_shards: u32,
        settings: Arc<Settings>,
        store: ColumnStoreRef,
        clock: Arc<IngestionClock>,
    ) -> Result<Self> {
        let rows = settings.memstore.max_chunks_size;
        // Rough per-buffer-set footprint: timestamps plus each value column
        let set_bytes = rows * 16 * dataset.schema.columns.len().max(1);
        let capacity = (settings.store.ingestion_buffer_mem_size / set_bytes.max(1)).max(8);
        let pool = Arc::new(WriteBufferPool::new(dataset.schema.clone(), rows, capacity)?);
        let blocks = Arc::new(BlockMemoryManager::new(settings.store.shard_mem_size));
        Ok(Self {
            dataset,
            shard_num,
            num_shards,
            settings,
            store,
            clock,
            partitions: DashMap::new(),
            by_part_id: DashMap::new(),
            next_part_id: AtomicU32::new(0),
            index: PartKeyIndex::new(),
            pool,
            blocks,
            new_part_keys: Mutex::new(Vec::new()),
            next_flush_group: AtomicUsize::new(0),
            counters: Counters::default(),
        })
    }

    pub fn shard_num(&self) -> u32 {
        self.shard_num
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Upper bound on one chunk's user-time span, used to bias read ranges.
    pub fn max_chunk_time_ms(&self) -> i64 {
        self.settings.store.flush_interval.as_millis() as i64
    }

    /// Ingest one record container. Out-of-order and schema-mismatch rows are
    /// dropped and counted; buffer exhaustion triggers an inline flush of the
    /// next group and a single retry before surfacing backpressure.
    pub async fn ingest(&self, container: &RecordContainer) -> Result<IngestStats> {
        let records = container.records()?;
        let ingestion_time = self.clock.now_ms();
        let mut stats = IngestStats::default();

        for record in records {
            let partition = self.get_or_create_partition(&record.part_key, record.timestamp)?;
            match partition.ingest(record.timestamp, &record.values, ingestion_time) {
                Ok(()) => stats.rows_ingested += 1,
                Err(Error::OutOfOrderSample { .. }) => {
                    stats.out_of_order_dropped += 1;
                    self.counters.out_of_order_dropped.fetch_add(1, Ordering::AcqRel);
                }
                Err(Error::SchemaMismatch(_)) => {
                    stats.schema_mismatch_dropped += 1;
                    self.counters
                        .schema_mismatch_dropped
                        .fetch_add(1, Ordering::AcqRel);
                }
                Err(Error::BufferPoolExhausted) | Err(Error::BlockMemoryExhausted { .. }) => {
                    debug!(shard = self.shard_num, "ingest blocked on buffers, flushing");
                    self.flush_next_group().await?;
                    match partition.ingest(record.timestamp, &record.values, ingestion_time) {
                        Ok(()) => stats.rows_ingested += 1,
                        Err(Error::OutOfOrderSample { .. }) => {
                            stats.out_of_order_dropped += 1;
                            self.counters.out_of_order_dropped.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(Error::SchemaMismatch(_)) => {
                            stats.schema_mismatch_dropped += 1;
                            self.counters
                                .schema_mismatch_dropped
                                .fetch_add(1, Ordering::AcqRel);
                        }
                        Err(other) => return Err(other),
                    }
                }
                Err(other) => return Err(other),
            }
        }
        self.counters
            .samples_ingested
            .fetch_add(stats.rows_ingested as u64, Ordering::AcqRel);

        // Newly created partitions become searchable here
        self.index.commit();
        self.evict_if_needed();
        Ok(stats)
    }

    fn get_or_create_partition(
        &self,
        part_key: &PartitionKey,
        first_ts: i64,
    ) -> Result<Arc<TimeSeriesPartition>> {
        if let Some(existing) = self.partitions.get(part_key.as_bytes()) {
            return Ok(existing.clone());
        }
        let labels = part_key
            .labels()
            .map_err(|e| Error::SchemaMismatch(format!("bad partition key: {e}")))?;
        let entry = self
            .partitions
            .entry(part_key.as_bytes().clone())
            .or_try_insert_with(|| -> Result<Arc<TimeSeriesPartition>> {
                let part_id = self.next_part_id.fetch_add(1, Ordering::AcqRel);
                let partition = Arc::new(TimeSeriesPartition::new(
                    part_id,
                    part_key.as_bytes().clone(),
                    self.dataset.dataset_ref(),
                    self.shard_num,
                    self.dataset.schema.clone(),
                    self.pool.clone(),
                    self.blocks.clone(),
                ));
                self.by_part_id.insert(part_id, partition.clone());
                self.index.add_partition(part_id, labels);
                self.new_part_keys.lock().push(PartKeyRecord {
                    part_key: part_key.as_bytes().clone(),
                    start_time: first_ts,
                    end_time: i64::MAX,
                });
                Ok(partition)
            })?;
        Ok(entry.clone())
    }

    /// Flush the next group in the rotation.
    pub async fn flush_next_group(&self) -> Result<usize> {
        let groups = self.settings.memstore.groups_per_shard.max(1);
        let group = self.next_flush_group.fetch_add(1, Ordering::AcqRel) % groups;
        self.flush_group(group).await
    }

    /// Seal and persist every dirty partition of `group`. Returns the number
    /// of chunk sets written.
    pub async fn flush_group(&self, group: usize) -> Result<usize> {
        let groups = self.settings.memstore.groups_per_shard.max(1);
        let ingestion_time = self.clock.now_ms();

        let dirty: Vec<Arc<TimeSeriesPartition>> = self
            .by_part_id
            .iter()
            .filter(|e| e.key() % groups as u32 == group as u32)
            .filter(|e| e.value().is_dirty())
            .map(|e| e.value().clone())
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }
        debug!(
            shard = self.shard_num,
            group,
            partitions = dirty.len(),
            "flushing group"
        );

        let mut records = Vec::new();
        let mut persisted_plan: Vec<(Arc<TimeSeriesPartition>, Vec<crate::chunk::ChunkId>)> =
            Vec::new();
        for partition in &dirty {
            if let Err(e) = partition.switch_buffers(true, ingestion_time) {
                warn!(shard = self.shard_num, error = %e, "buffer seal failed, flushing what is sealed");
            }
            let unpersisted = partition.unpersisted_chunks();
            if unpersisted.is_empty() {
                continue;
            }
            let ids = unpersisted.iter().map(|c| c.info.id).collect();
            for chunk_set in &unpersisted {
                records.push(ChunkSetRecord::from_chunk_set(
                    self.dataset.dataset_ref(),
                    self.shard_num,
                    partition.part_key().clone(),
                    chunk_set,
                ));
            }
            persisted_plan.push((partition.clone(), ids));
        }
        if records.is_empty() {
            return Ok(0);
        }

        let ttl = self.settings.store.disk_time_to_live.as_secs();
        let written = self.write_with_retry(records, ttl).await?;

        for (partition, ids) in persisted_plan {
            partition.mark_persisted(&ids);
            partition.trim_chunks(self.settings.memstore.chunks_to_keep);
        }
        self.flush_part_keys(ttl).await;
        self.counters.flushes_completed.fetch_add(1, Ordering::AcqRel);
        Ok(written)
    }

    async fn write_with_retry(&self, records: Vec<ChunkSetRecord>, ttl: u64) -> Result<usize> {
        let retries = self.settings.store.flush_retries.max(1);
        let backoff = self.settings.store.flush_retry_backoff;
        let dataset = self.dataset.dataset_ref();
        let mut last_err = None;
        for attempt in 1..=retries {
            match self
                .store
                .write(&dataset, stream::iter(records.clone()).boxed(), ttl)
                .await
            {
                Ok(written) => return Ok(written),
                Err(e) => {
                    warn!(
                        shard = self.shard_num,
                        attempt,
                        error = %e,
                        "chunk write failed"
                    );
                    last_err = Some(e);
                    if attempt < retries {
                        tokio::time::sleep(backoff * attempt as u32).await;
                    }
                }
            }
        }
        self.counters.flush_failures.fetch_add(1, Ordering::AcqRel);
        Err(last_err.unwrap_or(Error::RemoteWriteTimeout))
    }

    async fn flush_part_keys(&self, ttl: u64) {
        let pending: Vec<PartKeyRecord> = std::mem::take(&mut *self.new_part_keys.lock());
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        if let Err(e) = self
            .store
            .write_part_keys(
                &self.dataset.dataset_ref(),
                self.shard_num,
                stream::iter(pending.clone()).boxed(),
                ttl,
            )
            .await
        {
            warn!(shard = self.shard_num, error = %e, "part key write failed, requeueing");
            self.new_part_keys.lock().extend(pending);
        } else {
            debug!(shard = self.shard_num, count, "part keys persisted");
        }
    }

    /// Run the staggered flush schedule until cancelled. Each group flushes
    /// once per `flush_interval`, offset from its neighbors.
    pub async fn run_flush_schedule(self: Arc<Self>, token: CancellationToken) {
        let groups = self.settings.memstore.groups_per_shard.max(1);
        let tick = self.settings.store.flush_interval / groups as u32;
        info!(
            shard = self.shard_num,
            groups,
            tick_secs = tick.as_secs(),
            "flush schedule started"
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // Final sweep so shutdown loses nothing
                    for group in 0..groups {
                        if let Err(e) = self.flush_group(group).await {
                            warn!(shard = self.shard_num, group, error = %e, "shutdown flush failed");
                        }
                    }
                    info!(shard = self.shard_num, "flush schedule stopped");
                    return;
                }
                _ = tokio::time::sleep(tick) => {
                    if let Err(e) = self.flush_next_group().await {
                        warn!(shard = self.shard_num, error = %e, "scheduled flush failed");
                    }
                }
            }
        }
    }

    /// Resolve partitions for a scan, paging evicted data back in when demand
    /// paging is enabled, and snapshot each for the reader.
    pub async fn scan_partitions(
        &self,
        part_method: &PartitionScanMethod,
        range: TimeRange,
    ) -> Result<Vec<PartitionSnapshot>> {
        let query_time = self.clock.now_ms();
        let partitions = self.resolve_partitions(part_method)?;

        if self.settings.store.demand_paging_enabled {
            let needy: Vec<Arc<TimeSeriesPartition>> = partitions
                .iter()
                .filter(|p| p.needs_paging(range))
                .cloned()
                .collect();
            if !needy.is_empty() {
                self.page_partitions(&needy, range).await?;
            }
        }

        Ok(partitions
            .into_iter()
            .map(|p| p.snapshot(range, query_time))
            .filter(|s| !s.chunks.is_empty() || s.buffer.is_some())
            .collect())
    }

    fn resolve_partitions(
        &self,
        part_method: &PartitionScanMethod,
    ) -> Result<Vec<Arc<TimeSeriesPartition>>> {
        Ok(match part_method {
            PartitionScanMethod::AllShard(_) => {
                self.partitions.iter().map(|e| e.value().clone()).collect()
            }
            PartitionScanMethod::Filtered(_, filters) => {
                let snapshot = self.index.snapshot();
                snapshot
                    .ids_matching(filters)
                    .iter()
                    .filter_map(|id| self.by_part_id.get(&id).map(|e| e.clone()))
                    .collect()
            }
            PartitionScanMethod::Single(_, key) => {
                self.partitions.get(key).map(|e| e.clone()).into_iter().collect()
            }
            PartitionScanMethod::Multi(_, keys) => keys
                .iter()
                .filter_map(|k| self.partitions.get(k).map(|e| e.clone()))
                .collect(),
        })
    }

    /// Page chunks for evicted partitions back from the remote store.
    async fn page_partitions(
        &self,
        needy: &[Arc<TimeSeriesPartition>],
        range: TimeRange,
    ) -> Result<()> {
        self.counters.odp_reads.fetch_add(1, Ordering::AcqRel);
        let dataset = self.dataset.dataset_ref();
        let max_chunk_time = self.max_chunk_time_ms();
        let method = if self.settings.store.multi_partition_odp && needy.len() > 1 {
            PartitionScanMethod::Multi(
                self.shard_num,
                needy.iter().map(|p| p.part_key().clone()).collect(),
            )
        } else if needy.len() == 1 {
            PartitionScanMethod::Single(self.shard_num, needy[0].part_key().clone())
        } else {
            // Without multi-partition paging, issue one scan per partition
            for partition in needy {
                let single = std::slice::from_ref(partition);
                Box::pin(self.page_partitions(single, range)).await?;
            }
            return Ok(());
        };
        debug!(
            shard = self.shard_num,
            partitions = needy.len(),
            "on-demand paging from remote store"
        );
        let mut parts = self
            .store
            .read_raw_partitions(&dataset, max_chunk_time, method, ChunkScanMethod::ByTime(range))
            .await?;
        while let Some(raw) = parts.next().await {
            let raw = raw?;
            if let Some(partition) = self.partitions.get(&raw.part_key) {
                let mut sets = Vec::with_capacity(raw.chunk_sets.len());
                for raw_set in &raw.chunk_sets {
                    sets.push(crate::store::chunk_set_from_raw(raw_set)?);
                }
                partition.install_paged(sets);
            }
        }
        Ok(())
    }

    /// Rebuild the inverted index from the remote store's part-key table.
    /// Partitions come back as evicted stubs that page in on first read.
    pub async fn recover_index(&self) -> Result<usize> {
        let mut records = self
            .store
            .scan_part_keys(&self.dataset.dataset_ref(), self.shard_num)
            .await?;
        let mut recovered = 0usize;
        while let Some(record) = records.next().await {
            let record = record?;
            let key = PartitionKey::from_bytes(record.part_key.clone());
            let partition = self.get_or_create_partition(&key, record.start_time)?;
            partition.evict();
            recovered += 1;
        }
        // Recovered keys are already persisted remotely
        self.new_part_keys.lock().clear();
        self.index.commit();
        info!(shard = self.shard_num, recovered, "index recovered from part keys");
        Ok(recovered)
    }

    /// Evict least-recently-queried partitions while over budget. Evicted
    /// partitions keep their index entries as stubs.
    fn evict_if_needed(&self) {
        let max_partitions = self.settings.memstore.max_num_partitions;
        // Pressure: too many resident partitions, or block memory nearly full
        let resident = || {
            self.by_part_id
                .iter()
                .filter(|e| !e.value().is_evicted())
                .count()
        };
        let blocks_pressured =
            || self.blocks.available() < self.settings.store.shard_mem_size / 10;
        if resident() <= max_partitions && !blocks_pressured() {
            return;
        }

        let mut candidates: Vec<Arc<TimeSeriesPartition>> = self
            .by_part_id
            .iter()
            .map(|e| e.value().clone())
            .filter(|p| !p.is_evicted() && !p.is_dirty())
            .collect();
        candidates.sort_by_key(|p| p.last_queried());

        let mut evicted = 0usize;
        for partition in candidates {
            if resident() <= max_partitions && !blocks_pressured() {
                break;
            }
            if partition.evict() {
                evicted += 1;
                self.counters.partitions_evicted.fetch_add(1, Ordering::AcqRel);
            }
        }
        if evicted > 0 {
            info!(shard = self.shard_num, evicted, "evicted cold partitions");
        }
    }

    /// Snapshot of the inverted index for metadata queries
    pub fn index_snapshot(&self) -> Arc<IndexSnapshot> {
        self.index.snapshot()
    }

    /// Partition ids matching the filters, resolved to partition keys.
    pub fn part_keys_matching(&self, filters: &[ColumnFilter]) -> Vec<Bytes> {
        let snapshot = self.index.snapshot();
        snapshot
            .ids_matching(filters)
            .iter()
            .filter_map(|id| self.by_part_id.get(&id).map(|e| e.part_key().clone()))
            .collect()
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> ShardStats {
        ShardStats {
            num_partitions: self.partitions.len(),
            resident_partitions: self
                .by_part_id
                .iter()
                .filter(|e| !e.value().is_evicted())
                .count(),
            samples_ingested: self.counters.samples_ingested.load(Ordering::Acquire),
            out_of_order_dropped: self.counters.out_of_order_dropped.load(Ordering::Acquire),
            schema_mismatch_dropped: self
                .counters
                .schema_mismatch_dropped
                .load(Ordering::Acquire),
            flushes_completed: self.counters.flushes_completed.load(Ordering::Acquire),
            flush_failures: self.counters.flush_failures.load(Ordering::Acquire),
            partitions_evicted: self.counters.partitions_evicted.load(Ordering::Acquire),
            odp_reads: self.counters.odp_reads.load(Ordering::Acquire),
            block_memory_used: self.blocks.used(),
            buffers_available: self.pool.available(),
        }
    }

    /// Number of shards in this dataset (for fan-out planning)
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }
}
