//! Columnar chunk codecs and chunk-set containers
//!
//! A chunk is a sealed, compressed column segment. One flush produces a
//! `ChunkSet`: same-length chunks for the timestamp column and every value
//! column, sharing one `ChunkInfo`. Encoders are append-only and
//! type-specific:
//!
//! - timestamps: delta-of-delta with run-length segments
//! - doubles: XOR-compressed floats with counter-dip tracking
//! - histograms: bucket-scheme header + per-bucket delta-varint columns

mod bitstream;
mod blocks;
mod doubles;
mod histogram;
mod pool;
mod timestamp;
mod varint;

pub use bitstream::{BitReader, BitWriter};
pub use blocks::{BlockGuard, BlockMemoryManager};
pub use doubles::{DoubleEncoder, DoubleReader};
pub use histogram::{HistogramEncoder, HistogramReader};
pub use pool::{ColumnBuffer, WriteBufferPool, WriteBuffers};
pub use timestamp::{TimestampEncoder, TimestampReader};

use crate::schema::{ColumnType, Schema};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Bits of a chunk id reserved for the intra-millisecond sequence
const CHUNK_ID_SEQ_BITS: u32 = 10;

/// Monotonic, time-encoded chunk identifier.
///
/// The id embeds the chunk's start time in its high bits, so for chunks with
/// distinct start times `id(t1) > id(t2) ⇔ t1 > t2`. The low bits carry a
/// per-partition sequence that disambiguates multiple flushes within one
/// millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub i64);

impl ChunkId {
    /// Build an id from a start time and sequence number
    pub fn new(start_time_ms: i64, seq: u32) -> Self {
        Self((start_time_ms << CHUNK_ID_SEQ_BITS) | (seq as i64 & ((1 << CHUNK_ID_SEQ_BITS) - 1)))
    }

    /// The start time encoded in the id
    pub fn start_time(&self) -> i64 {
        self.0 >> CHUNK_ID_SEQ_BITS
    }
}

/// Metadata shared by all chunks of one chunk set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Monotonic, time-encoded id; unique within a partition
    pub id: ChunkId,
    /// First sample timestamp (user time, millis)
    pub start_time: i64,
    /// Last sample timestamp (user time, millis)
    pub end_time: i64,
    /// Wall-clock time the data entered the system
    pub ingestion_time: i64,
    /// Row count, identical across the set's chunks
    pub num_rows: u32,
}

impl ChunkInfo {
    /// Serialized size of the info blob
    pub const ENCODED_LEN: usize = 36;

    /// Serialize for the remote store's index row
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_i64(self.id.0);
        buf.put_i64(self.start_time);
        buf.put_i64(self.end_time);
        buf.put_i64(self.ingestion_time);
        buf.put_u32(self.num_rows);
        buf.freeze()
    }

    /// Deserialize from an index-row info blob
    pub fn from_bytes(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(Error::ChunkDecode("chunk info blob too short".into()));
        }
        Ok(Self {
            id: ChunkId(buf.get_i64()),
            start_time: buf.get_i64(),
            end_time: buf.get_i64(),
            ingestion_time: buf.get_i64(),
            num_rows: buf.get_u32(),
        })
    }

    /// Whether this chunk's user-time range intersects `[start, end]`
    pub fn intersects(&self, start: i64, end: i64) -> bool {
        self.start_time <= end && self.end_time >= start
    }
}

/// A sealed bundle of same-length column chunks
#[derive(Debug)]
pub struct ChunkSet {
    /// Shared metadata
    pub info: ChunkInfo,
    /// Encoded column chunks in schema order (timestamp first)
    pub columns: Vec<Bytes>,
    /// Keeps the backing block alive while any reader holds this set
    _block: Option<BlockGuard>,
}

impl ChunkSet {
    /// Assemble a chunk set from already-encoded columns.
    pub fn new(info: ChunkInfo, columns: Vec<Bytes>, block: Option<BlockGuard>) -> Self {
        Self {
            info,
            columns,
            _block: block,
        }
    }

    /// Total encoded size across columns
    pub fn encoded_size(&self) -> usize {
        self.columns.iter().map(|c| c.len()).sum()
    }

    /// Serialize all columns into one blob for the remote chunk table.
    pub fn columns_blob(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.columns.len() as u16);
        for col in &self.columns {
            buf.put_u32(col.len() as u32);
            buf.put_slice(col);
        }
        buf.freeze()
    }

    /// Inverse of [`columns_blob`](Self::columns_blob).
    pub fn columns_from_blob(mut blob: Bytes) -> Result<Vec<Bytes>> {
        if blob.len() < 2 {
            return Err(Error::ChunkDecode("chunk blob too short".into()));
        }
        let count = blob.get_u16() as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            if blob.len() < 4 {
                return Err(Error::ChunkDecode("chunk blob truncated".into()));
            }
            let len = blob.get_u32() as usize;
            if blob.len() < len {
                return Err(Error::ChunkDecode("chunk column truncated".into()));
            }
            columns.push(blob.split_to(len));
        }
        Ok(columns)
    }
}

/// Decoded reader over one chunk set
pub struct ChunkSetReader {
    chunk_set: Arc<ChunkSet>,
    schema: Arc<Schema>,
}

impl ChunkSetReader {
    pub fn new(chunk_set: Arc<ChunkSet>, schema: Arc<Schema>) -> Self {
        Self { chunk_set, schema }
    }

    /// Shared metadata
    pub fn info(&self) -> &ChunkInfo {
        &self.chunk_set.info
    }

    /// Reader over the timestamp column
    pub fn timestamps(&self) -> Result<TimestampReader> {
        TimestampReader::new(&self.chunk_set.columns[0])
    }

    /// Reader over a double value column, addressed by column id.
    pub fn doubles(&self, column_id: u16) -> Result<DoubleReader> {
        let ix = self.column_index(column_id, ColumnType::Double)?;
        DoubleReader::new(&self.chunk_set.columns[ix])
    }

    /// Reader over a histogram value column, addressed by column id.
    pub fn histograms(&self, column_id: u16) -> Result<HistogramReader> {
        let ix = self.column_index(column_id, ColumnType::Histogram)?;
        HistogramReader::new(&self.chunk_set.columns[ix])
    }

    fn column_index(&self, column_id: u16, expect: ColumnType) -> Result<usize> {
        let (ix, col) = self
            .schema
            .columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.id == column_id)
            .ok_or_else(|| Error::UndefinedColumn(format!("column id {column_id}")))?;
        if col.column_type != expect {
            return Err(Error::SchemaMismatch(format!(
                "column {} is {:?}, expected {:?}",
                col.name, col.column_type, expect
            )));
        }
        if ix >= self.chunk_set.columns.len() {
            return Err(Error::ChunkDecode(format!(
                "chunk set has no column at index {ix}"
            )));
        }
        Ok(ix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_order_with_time() {
        let a = ChunkId::new(1_000, 5);
        let b = ChunkId::new(2_000, 0);
        let c = ChunkId::new(2_000, 1);
        assert!(b > a);
        assert!(c > b);
        assert_eq!(b.start_time(), 2_000);
    }

    #[test]
    fn chunk_info_roundtrip() {
        let info = ChunkInfo {
            id: ChunkId::new(1_700_000_000_000, 3),
            start_time: 1_700_000_000_000,
            end_time: 1_700_000_360_000,
            ingestion_time: 1_700_000_400_000,
            num_rows: 360,
        };
        let decoded = ChunkInfo::from_bytes(&info.to_bytes()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn columns_blob_roundtrip() {
        let info = ChunkInfo {
            id: ChunkId::new(1, 0),
            start_time: 1,
            end_time: 2,
            ingestion_time: 3,
            num_rows: 1,
        };
        let set = ChunkSet::new(
            info,
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defg")],
            None,
        );
        let cols = ChunkSet::columns_from_blob(set.columns_blob()).unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(&cols[1][..], b"defg");
    }

    #[test]
    fn intersects_is_inclusive() {
        let info = ChunkInfo {
            id: ChunkId::new(100, 0),
            start_time: 100,
            end_time: 200,
            ingestion_time: 250,
            num_rows: 10,
        };
        assert!(info.intersects(200, 300));
        assert!(info.intersects(50, 100));
        assert!(!info.intersects(201, 300));
    }
}
