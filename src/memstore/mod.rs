//! In-memory write store
//!
//! The memstore is a directory of (dataset → shard → partition). It routes
//! ingest containers to shards, runs their flush schedules, and serves
//! partition scans to the query engine.

mod index;
mod partition;
mod shard;

pub use index::{ColumnFilter, FilterOp, IndexSnapshot, PartKeyIndex};
pub use partition::{BufferData, ColumnData, PartitionSnapshot, TimeSeriesPartition};
pub use shard::{IngestStats, ShardStats, TimeSeriesShard};

use crate::clock::IngestionClock;
use crate::config::Settings;
use crate::schema::{Dataset, DatasetRef, RecordContainer};
use crate::store::{ColumnStoreRef, PartitionScanMethod, TimeRange};
use crate::{Error, Result};
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct DatasetShards {
    dataset: Arc<Dataset>,
    num_shards: u32,
    shards: DashMap<u32, Arc<TimeSeriesShard>>,
}

/// Top-level directory of datasets and their shards
pub struct TimeSeriesMemStore {
    settings: Arc<Settings>,
    store: ColumnStoreRef,
    clock: Arc<IngestionClock>,
    datasets: DashMap<DatasetRef, DatasetShards>,
}

/// Cancellable handle for a running ingest stream
pub struct IngestStreamHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl IngestStreamHandle {
    /// Ask the consumer to stop after the in-flight container.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the consumer task to finish.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

impl TimeSeriesMemStore {
    pub fn new(settings: Settings, store: ColumnStoreRef) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            clock: Arc::new(IngestionClock::new()),
            datasets: DashMap::new(),
        }
    }

    /// Register a dataset shard. Idempotent: repeating a `(dataset, shard)`
    /// pair is a no-op.
    pub async fn setup(&self, dataset: &Dataset, num_shards: u32, shard: u32) -> Result<()> {
        if shard >= num_shards {
            return Err(Error::BadQuery(format!(
                "shard {shard} out of range for {num_shards} shards"
            )));
        }
        self.store.initialize(&dataset.dataset_ref(), num_shards).await?;
        let entry = self
            .datasets
            .entry(dataset.dataset_ref())
            .or_insert_with(|| DatasetShards {
                dataset: Arc::new(dataset.clone()),
                num_shards,
                shards: DashMap::new(),
            });
        if !entry.shards.contains_key(&shard) {
            let ts_shard = Arc::new(TimeSeriesShard::new(
                entry.dataset.clone(),
                shard,
                num_shards,
                self.settings.clone(),
                self.store.clone(),
                self.clock.clone(),
            )?);
            entry.shards.insert(shard, ts_shard);
            info!(dataset = %dataset.name, shard, "shard set up");
        }
        Ok(())
    }

    /// The dataset definition registered under `dataset_ref`
    pub fn dataset(&self, dataset_ref: &DatasetRef) -> Result<Arc<Dataset>> {
        self.datasets
            .get(dataset_ref)
            .map(|e| e.dataset.clone())
            .ok_or_else(|| Error::UnknownDataset(dataset_ref.to_string()))
    }

    /// One shard of a dataset
    pub fn shard(&self, dataset_ref: &DatasetRef, shard: u32) -> Result<Arc<TimeSeriesShard>> {
        let entry = self
            .datasets
            .get(dataset_ref)
            .ok_or_else(|| Error::UnknownDataset(dataset_ref.to_string()))?;
        entry
            .shards
            .get(&shard)
            .map(|s| s.clone())
            .ok_or_else(|| Error::BadQuery(format!("shard {shard} not set up for {dataset_ref}")))
    }

    /// All shards of a dataset set up on this node, ordered by shard number
    pub fn shards(&self, dataset_ref: &DatasetRef) -> Result<Vec<Arc<TimeSeriesShard>>> {
        let entry = self
            .datasets
            .get(dataset_ref)
            .ok_or_else(|| Error::UnknownDataset(dataset_ref.to_string()))?;
        let mut shards: Vec<Arc<TimeSeriesShard>> =
            entry.shards.iter().map(|e| e.value().clone()).collect();
        shards.sort_by_key(|s| s.shard_num());
        Ok(shards)
    }

    /// Shards configured for a dataset (whether or not resident here)
    pub fn num_shards(&self, dataset_ref: &DatasetRef) -> Result<u32> {
        self.datasets
            .get(dataset_ref)
            .map(|e| e.num_shards)
            .ok_or_else(|| Error::UnknownDataset(dataset_ref.to_string()))
    }

    /// Ingest one container into a shard.
    pub async fn ingest(
        &self,
        dataset_ref: &DatasetRef,
        shard: u32,
        container: &RecordContainer,
    ) -> Result<IngestStats> {
        self.shard(dataset_ref, shard)?.ingest(container).await
    }

    /// Consume a stream of record containers for one shard until the stream
    /// ends or the handle is cancelled. Non-fatal ingest errors are counted by
    /// the shard; fatal errors go to `error_cb` and end consumption.
    pub fn ingest_stream(
        &self,
        dataset_ref: &DatasetRef,
        shard: u32,
        mut containers: BoxStream<'static, RecordContainer>,
        error_cb: Box<dyn Fn(Error) + Send + Sync>,
    ) -> Result<IngestStreamHandle> {
        let ts_shard = self.shard(dataset_ref, shard)?;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        info!(shard = ts_shard.shard_num(), "ingest stream cancelled");
                        return;
                    }
                    next = containers.next() => {
                        let Some(container) = next else {
                            info!(shard = ts_shard.shard_num(), "ingest stream ended");
                            return;
                        };
                        if let Err(e) = ts_shard.ingest(&container).await {
                            error!(shard = ts_shard.shard_num(), error = %e, "fatal ingest error");
                            error_cb(e);
                            return;
                        }
                    }
                }
            }
        });
        Ok(IngestStreamHandle { token, join })
    }

    /// Spawn flush schedules for every resident shard of a dataset. The
    /// returned token stops them; cancellation flushes all groups first.
    pub fn spawn_flush_schedules(&self, dataset_ref: &DatasetRef) -> Result<CancellationToken> {
        let token = CancellationToken::new();
        for shard in self.shards(dataset_ref)? {
            tokio::spawn(shard.run_flush_schedule(token.clone()));
        }
        Ok(token)
    }

    /// Scan partitions of one shard for a query. `range` must already carry
    /// the max-chunk-time bias on its start.
    pub async fn scan(
        &self,
        dataset_ref: &DatasetRef,
        part_method: &PartitionScanMethod,
        range: TimeRange,
    ) -> Result<Vec<PartitionSnapshot>> {
        self.shard(dataset_ref, part_method.shard())?
            .scan_partitions(part_method, range)
            .await
    }

    /// The ingestion clock shared by all shards
    pub fn clock(&self) -> &Arc<IngestionClock> {
        &self.clock
    }

    /// Node-wide settings
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }
}
