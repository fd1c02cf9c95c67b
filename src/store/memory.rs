//! In-memory column store
//!
//! Backs tests and single-node development the way a real wide-column cluster
//! backs production. Honors the same layout contract: chunk rows keyed by
//! `(partition, chunk_id)`, index rows keyed by `(partition, ingestion_time,
//! start_time)`, and a write counts only when both landed.

use super::{
    ChunkScanMethod, ChunkSetRecord, ChunkSink, ChunkSource, PartKeyRecord, PartitionScanMethod,
    RawChunkSet, RawPartData, ScanSplit,
};
use crate::chunk::{ChunkInfo, ChunkSet};
use crate::schema::{DatasetRef, PartitionKey};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct StoredChunkSet {
    info: ChunkInfo,
    columns: Bytes,
}

#[derive(Debug, Default)]
struct PartitionRows {
    /// Chunk table rows, keyed by chunk id
    chunks: BTreeMap<i64, StoredChunkSet>,
    /// Index rows, keyed by (ingestion_time, start_time)
    index: BTreeMap<(i64, i64), ChunkInfo>,
}

#[derive(Default)]
struct DatasetTables {
    num_shards: u32,
    /// partition key -> rows
    partitions: DashMap<Bytes, PartitionRows>,
    /// shard -> part-key records
    part_keys: DashMap<u32, Vec<PartKeyRecord>>,
    /// shard owning each partition key, tracked at write time
    shard_of: DashMap<Bytes, u32>,
}

/// In-memory `ChunkSink`/`ChunkSource` implementation
#[derive(Default)]
pub struct InMemoryColumnStore {
    datasets: DashMap<DatasetRef, DatasetTables>,
    /// Writes to fail before succeeding again, for retry tests
    fail_next_writes: AtomicUsize,
    /// Chunk sets written over the store's lifetime
    chunk_sets_written: AtomicUsize,
    write_log: RwLock<Vec<DatasetRef>>,
}

impl InMemoryColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with `RemoteWriteRejected`.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next_writes.store(n, Ordering::Release);
    }

    /// Total chunk sets accepted since creation
    pub fn chunk_sets_written(&self) -> usize {
        self.chunk_sets_written.load(Ordering::Acquire)
    }

    /// Number of `write` calls that reached the store
    pub fn write_calls(&self) -> usize {
        self.write_log.read().len()
    }

    fn tables(&self, dataset: &DatasetRef) -> Result<dashmap::mapref::one::Ref<'_, DatasetRef, DatasetTables>> {
        self.datasets
            .get(dataset)
            .ok_or_else(|| Error::UnknownDataset(dataset.to_string()))
    }

    fn collect_partition(
        rows: &PartitionRows,
        part_key: &Bytes,
        chunk_method: ChunkScanMethod,
        max_chunk_time: i64,
    ) -> Option<RawPartData> {
        let chunk_sets: Vec<RawChunkSet> = rows
            .chunks
            .values()
            .filter(|c| match chunk_method {
                ChunkScanMethod::All => true,
                ChunkScanMethod::ByTime(range) => c
                    .info
                    .intersects(range.start - max_chunk_time, range.end),
                ChunkScanMethod::InMemory => false,
            })
            .map(|c| RawChunkSet {
                info: c.info,
                columns: c.columns.clone(),
            })
            .collect();
        if chunk_sets.is_empty() {
            return None;
        }
        Some(RawPartData {
            part_key: part_key.clone(),
            chunk_sets,
        })
    }

    fn partition_matches(method: &PartitionScanMethod, part_key: &Bytes, shard: u32) -> bool {
        match method {
            PartitionScanMethod::AllShard(s) => shard == *s,
            PartitionScanMethod::Filtered(s, filters) => {
                if shard != *s {
                    return false;
                }
                match PartitionKey::from_bytes(part_key.clone()).labels() {
                    Ok(labels) => filters.iter().all(|f| f.matches_labels(&labels)),
                    Err(_) => false,
                }
            }
            PartitionScanMethod::Single(s, key) => shard == *s && part_key == key,
            PartitionScanMethod::Multi(s, keys) => shard == *s && keys.contains(part_key),
        }
    }
}

#[async_trait]
impl ChunkSink for InMemoryColumnStore {
    async fn initialize(&self, dataset: &DatasetRef, num_shards: u32) -> Result<()> {
        self.datasets
            .entry(dataset.clone())
            .or_insert_with(|| DatasetTables {
                num_shards,
                ..Default::default()
            });
        Ok(())
    }

    async fn truncate(&self, dataset: &DatasetRef, num_shards: u32) -> Result<()> {
        self.datasets.insert(
            dataset.clone(),
            DatasetTables {
                num_shards,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn write(
        &self,
        dataset: &DatasetRef,
        mut chunk_sets: BoxStream<'_, ChunkSetRecord>,
        _ttl_seconds: u64,
    ) -> Result<usize> {
        self.write_log.write().push(dataset.clone());
        let remaining = self.fail_next_writes.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_next_writes.store(remaining - 1, Ordering::Release);
            return Err(Error::RemoteWriteRejected("injected failure".into()));
        }

        let tables = self.tables(dataset)?;
        let mut written = 0usize;
        while let Some(record) = chunk_sets.next().await {
            let mut rows = tables.partitions.entry(record.part_key.clone()).or_default();
            // Chunk row and index row land together; the entry lock makes the
            // pair atomic with respect to readers of this partition.
            rows.chunks.insert(
                record.info.id.0,
                StoredChunkSet {
                    info: record.info,
                    columns: record.columns.clone(),
                },
            );
            rows.index.insert(
                (record.info.ingestion_time, record.info.start_time),
                record.info,
            );
            drop(rows);
            tables.shard_of.insert(record.part_key.clone(), record.shard);
            written += 1;
        }
        self.chunk_sets_written.fetch_add(written, Ordering::AcqRel);
        Ok(written)
    }

    async fn write_part_keys(
        &self,
        dataset: &DatasetRef,
        shard: u32,
        mut records: BoxStream<'_, PartKeyRecord>,
        _ttl_seconds: u64,
    ) -> Result<usize> {
        let tables = self.tables(dataset)?;
        let mut written = 0usize;
        while let Some(record) = records.next().await {
            tables.part_keys.entry(shard).or_default().push(record);
            written += 1;
        }
        Ok(written)
    }
}

#[async_trait]
impl ChunkSource for InMemoryColumnStore {
    async fn read_raw_partitions(
        &self,
        dataset: &DatasetRef,
        max_chunk_time: i64,
        part_method: PartitionScanMethod,
        chunk_method: ChunkScanMethod,
    ) -> Result<BoxStream<'static, Result<RawPartData>>> {
        let tables = self.tables(dataset)?;
        let num_shards = tables.num_shards.max(1);
        let mut out = Vec::new();
        for entry in tables.partitions.iter() {
            let part_key = entry.key();
            let shard = tables
                .shard_of
                .get(part_key)
                .map(|s| *s)
                .unwrap_or_else(|| PartitionKey::from_bytes(part_key.clone()).shard(num_shards));
            if !Self::partition_matches(&part_method, part_key, shard) {
                continue;
            }
            if let Some(data) =
                Self::collect_partition(entry.value(), part_key, chunk_method, max_chunk_time)
            {
                out.push(Ok(data));
            }
        }
        Ok(stream::iter(out).boxed())
    }

    async fn chunks_by_ingestion_time_range(
        &self,
        dataset: &DatasetRef,
        splits: Vec<ScanSplit>,
        ing_start: i64,
        ing_end: i64,
        user_start: i64,
        user_end: i64,
        _max_chunk_time: i64,
        batch_size: usize,
    ) -> Result<BoxStream<'static, Result<Vec<RawPartData>>>> {
        let tables = self.tables(dataset)?;
        let mut parts = Vec::new();
        for entry in tables.partitions.iter() {
            let part_key = entry.key();
            let token = PartitionKey::from_bytes(part_key.clone()).stable_hash() as u64;
            let in_split = splits.is_empty()
                || splits
                    .iter()
                    .any(|s| token >= s.start_token && token <= s.end_token);
            if !in_split {
                continue;
            }
            let rows = entry.value();
            let chunk_sets: Vec<RawChunkSet> = rows
                .index
                .range((ing_start, i64::MIN)..(ing_end, i64::MIN))
                .filter(|(_, info)| info.start_time < user_end && info.end_time >= user_start)
                .filter_map(|(_, info)| {
                    rows.chunks.get(&info.id.0).map(|c| RawChunkSet {
                        info: *info,
                        columns: c.columns.clone(),
                    })
                })
                .collect();
            if !chunk_sets.is_empty() {
                parts.push(RawPartData {
                    part_key: part_key.clone(),
                    chunk_sets,
                });
            }
        }
        // Deterministic batch order regardless of map iteration
        parts.sort_by(|a, b| a.part_key.cmp(&b.part_key));
        let batches: Vec<Result<Vec<RawPartData>>> = parts
            .chunks(batch_size.max(1))
            .map(|batch| Ok(batch.to_vec()))
            .collect();
        Ok(stream::iter(batches).boxed())
    }

    async fn scan_splits(
        &self,
        dataset: &DatasetRef,
        splits_per_node: usize,
    ) -> Result<Vec<ScanSplit>> {
        self.tables(dataset)?;
        let n = splits_per_node.max(1) as u64;
        let span = (u32::MAX as u64 + 1) / n;
        Ok((0..n)
            .map(|i| ScanSplit {
                start_token: i * span,
                end_token: if i == n - 1 {
                    u32::MAX as u64
                } else {
                    (i + 1) * span - 1
                },
                replicas: vec!["localhost".to_string()],
            })
            .collect())
    }

    async fn scan_part_keys(
        &self,
        dataset: &DatasetRef,
        shard: u32,
    ) -> Result<BoxStream<'static, Result<PartKeyRecord>>> {
        let tables = self.tables(dataset)?;
        let records: Vec<Result<PartKeyRecord>> = tables
            .part_keys
            .get(&shard)
            .map(|r| r.iter().cloned().map(Ok).collect())
            .unwrap_or_default();
        Ok(stream::iter(records).boxed())
    }
}

/// Reassemble a `ChunkSet` from raw store bytes.
pub fn chunk_set_from_raw(raw: &RawChunkSet) -> Result<ChunkSet> {
    let columns = ChunkSet::columns_from_blob(raw.columns.clone())?;
    Ok(ChunkSet::new(raw.info, columns, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkId;
    use crate::schema::Labels;
    use futures::StreamExt;

    fn record(dataset: &DatasetRef, app: &str, start: i64, ing: i64) -> ChunkSetRecord {
        let mut labels = Labels::new();
        labels.insert("app".into(), app.into());
        let key = PartitionKey::from_labels(&labels);
        ChunkSetRecord {
            dataset: dataset.clone(),
            shard: key.shard(4),
            part_key: key.as_bytes().clone(),
            info: ChunkInfo {
                id: ChunkId::new(start, 0),
                start_time: start,
                end_time: start + 1000,
                ingestion_time: ing,
                num_rows: 10,
            },
            columns: Bytes::from_static(b"\x00\x00"),
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let store = InMemoryColumnStore::new();
        let dataset = DatasetRef::from("metrics");
        store.initialize(&dataset, 4).await.unwrap();

        let records = vec![record(&dataset, "x", 1000, 5000), record(&dataset, "x", 2000, 6000)];
        let shard = records[0].shard;
        let n = store
            .write(&dataset, stream::iter(records).boxed(), 3600)
            .await
            .unwrap();
        assert_eq!(n, 2);

        let mut parts = store
            .read_raw_partitions(
                &dataset,
                0,
                PartitionScanMethod::AllShard(shard),
                ChunkScanMethod::All,
            )
            .await
            .unwrap();
        let part = parts.next().await.unwrap().unwrap();
        assert_eq!(part.chunk_sets.len(), 2);
        assert!(parts.next().await.is_none());
    }

    #[tokio::test]
    async fn ingestion_time_scan_bounds_are_half_open() {
        let store = InMemoryColumnStore::new();
        let dataset = DatasetRef::from("metrics");
        store.initialize(&dataset, 4).await.unwrap();
        let records = vec![
            record(&dataset, "a", 1000, 5000),
            record(&dataset, "a", 2000, 6000),
            record(&dataset, "a", 3000, 7000),
        ];
        store
            .write(&dataset, stream::iter(records).boxed(), 3600)
            .await
            .unwrap();

        let mut batches = store
            .chunks_by_ingestion_time_range(&dataset, vec![], 5000, 7000, 0, i64::MAX, 0, 10)
            .await
            .unwrap();
        let batch = batches.next().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        // ing_end exclusive: 7000 not included
        assert_eq!(batch[0].chunk_sets.len(), 2);
    }

    #[tokio::test]
    async fn unknown_dataset_errors() {
        let store = InMemoryColumnStore::new();
        let result = store
            .read_raw_partitions(
                &DatasetRef::from("nope"),
                0,
                PartitionScanMethod::AllShard(0),
                ChunkScanMethod::All,
            )
            .await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, Error::UnknownDataset(_)));
    }

    #[tokio::test]
    async fn scan_splits_cover_token_space() {
        let store = InMemoryColumnStore::new();
        let dataset = DatasetRef::from("metrics");
        store.initialize(&dataset, 1).await.unwrap();
        let splits = store.scan_splits(&dataset, 4).await.unwrap();
        assert_eq!(splits.len(), 4);
        assert_eq!(splits[0].start_token, 0);
        assert_eq!(splits[3].end_token, u32::MAX as u64);
        for pair in splits.windows(2) {
            assert_eq!(pair[0].end_token + 1, pair[1].start_token);
        }
    }

    #[tokio::test]
    async fn injected_failures_reject_writes() {
        let store = InMemoryColumnStore::new();
        let dataset = DatasetRef::from("metrics");
        store.initialize(&dataset, 1).await.unwrap();
        store.fail_next_writes(1);

        let r = vec![record(&dataset, "x", 1000, 5000)];
        let err = store
            .write(&dataset, stream::iter(r.clone()).boxed(), 60)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteWriteRejected(_)));

        let n = store.write(&dataset, stream::iter(r).boxed(), 60).await.unwrap();
        assert_eq!(n, 1);
    }
}
