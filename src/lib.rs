//! # Tephra
//!
//! A sharded, columnar time-series engine for Prometheus-style metrics:
//! an in-memory write store with compressed chunks and asynchronous
//! persistence to a wide-column remote store, a multi-resolution
//! downsampling pipeline, and a PromQL-style logical/physical query engine.
//!
//! ## Key pieces
//!
//! - **Chunked columnar memstore**: per-series partitions with bounded write
//!   buffers seal into delta-of-delta / XOR / histogram-codec chunks, flushed
//!   on a staggered group schedule and paged back on demand after eviction
//! - **Inverted label index**: roaring-bitmap postings with staged commits
//!   and copy-on-write query snapshots
//! - **Downsample pipeline**: deterministic period marking (counter-aware)
//!   and per-column downsamplers feeding lower-resolution datasets
//! - **Query engine**: logical plan → per-shard exec plan fan-out →
//!   range-vector streams through window functions, joins, set operators,
//!   and aggregations
//!
//! ## Architecture
//!
//! Samples arrive as checksummed record containers routed to a shard by
//! partition-key hash. Queries materialize into exec trees whose leaves scan
//! memstore partitions (pulling evicted chunks from the remote store when
//! needed) and whose inner nodes compose cancellable range-vector streams.

pub mod chunk;
pub mod clock;
pub mod config;
pub mod downsample;
pub mod memstore;
pub mod query;
pub mod schema;
pub mod store;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::downsample::DownsamplePipeline;
    pub use crate::memstore::{ColumnFilter, TimeSeriesMemStore};
    pub use crate::query::{LogicalPlan, QueryContext, QueryEngine};
    pub use crate::schema::{Dataset, DatasetRef, Labels, PartitionKey, RecordBuilder, Schema};
    pub use crate::store::{ChunkSink, ChunkSource, InMemoryColumnStore};
    pub use crate::{Error, Result};
}
