//! Immutable settings tree
//!
//! All tunables live here as plain values built at startup and passed down
//! explicitly; nothing reads process-global mutable state. The embedder is
//! responsible for loading these from its own configuration source.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings for a Tephra node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Memstore sizing and flush behavior
    pub memstore: MemStoreConfig,
    /// Persistence and paging behavior
    pub store: StoreConfig,
    /// Downsample pipeline parameters
    pub downsampler: DownsamplerConfig,
    /// Query admission limits
    pub query: QueryConfig,
}

/// Memstore sizing knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemStoreConfig {
    /// Number of sealed chunk sets to keep in memory per partition
    pub chunks_to_keep: usize,
    /// Maximum rows per chunk (write buffers seal at this size)
    pub max_chunks_size: usize,
    /// Maximum in-memory partitions per shard before eviction kicks in
    pub max_num_partitions: usize,
    /// Number of flush groups per shard (staggered flush schedule)
    pub groups_per_shard: usize,
    /// Total shard memory budget in megabytes (buffers + blocks)
    pub shard_memory_mb: usize,
}

impl Default for MemStoreConfig {
    fn default() -> Self {
        Self {
            chunks_to_keep: 12,      // ~12h at 1h chunks
            max_chunks_size: 400,    // rows per chunk
            max_num_partitions: 250_000,
            groups_per_shard: 60,
            shard_memory_mb: 1024,
        }
    }
}

/// Persistence and paging knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Interval between flushes of a single flush group
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,
    /// TTL applied to chunks written to the remote store
    #[serde(with = "duration_secs")]
    pub disk_time_to_live: Duration,
    /// Off-heap block memory budget per shard, in bytes
    pub shard_mem_size: usize,
    /// Write-buffer pool budget per shard, in bytes
    pub ingestion_buffer_mem_size: usize,
    /// Whether evicted/missing chunks are paged back from the remote store
    pub demand_paging_enabled: bool,
    /// Page all matching partitions of a query in one remote scan
    pub multi_partition_odp: bool,
    /// Remote write attempts before a flush is declared failed
    pub flush_retries: usize,
    /// Base delay for linear flush retry backoff
    #[serde(with = "duration_secs")]
    pub flush_retry_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3600), // 1h chunks
            disk_time_to_live: Duration::from_secs(3 * 24 * 3600),
            shard_mem_size: 512 * 1024 * 1024,
            ingestion_buffer_mem_size: 200 * 1024 * 1024,
            demand_paging_enabled: true,
            multi_partition_odp: false,
            flush_retries: 5,
            flush_retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Downsample pipeline knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownsamplerConfig {
    /// Output resolutions, coarsest last
    #[serde(with = "duration_secs_vec")]
    pub resolutions: Vec<Duration>,
    /// TTLs for each resolution's dataset, same length as `resolutions`
    #[serde(with = "duration_secs_vec")]
    pub ttls: Vec<Duration>,
    /// Names of raw schemas eligible for downsampling
    pub raw_schema_names: Vec<String>,
    /// Output partitions flushed per remote write batch
    pub num_partitions_per_write: usize,
    /// Off-heap block memory for downsample output chunks, in bytes
    pub off_heap_block_memory_size: usize,
    /// Native memory for downsample write buffers, in bytes
    pub off_heap_native_memory_size: usize,
    /// Slack added on both sides of the ingestion-time scan window
    #[serde(with = "duration_secs")]
    pub widen_ingestion_time_range_by: Duration,
    /// Fixed ingestion time for outputs; makes re-runs byte-identical
    pub user_time_override: Option<i64>,
}

impl Default for DownsamplerConfig {
    fn default() -> Self {
        Self {
            resolutions: vec![Duration::from_secs(60), Duration::from_secs(3600)],
            ttls: vec![
                Duration::from_secs(30 * 24 * 3600),  // 30d at 1m
                Duration::from_secs(183 * 24 * 3600), // 183d at 1h
            ],
            raw_schema_names: vec!["prom-counter".into(), "prom-gauge".into()],
            num_partitions_per_write: 100,
            off_heap_block_memory_size: 64 * 1024 * 1024,
            off_heap_native_memory_size: 32 * 1024 * 1024,
            widen_ingestion_time_range_by: Duration::from_secs(1800),
            user_time_override: None,
        }
    }
}

/// Query admission knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Maximum samples a single query may stream before erroring
    pub sample_limit: usize,
    /// Per-query deadline
    #[serde(with = "duration_secs")]
    pub ask_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            sample_limit: 1_000_000,
            ask_timeout: Duration::from_secs(30),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_secs_vec {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(|d| d.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<u64>::deserialize(d)?
            .into_iter()
            .map(Duration::from_secs)
            .collect())
    }
}
