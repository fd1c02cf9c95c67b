//! Partition keys
//!
//! The serialized label set of one time series. The byte form is the identity
//! of the series: equal labels always serialize to equal bytes (labels are
//! sorted), and the stable hash of those bytes assigns the series to a shard.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Ordered label name → value map
pub type Labels = BTreeMap<String, String>;

/// Serialized partition-key bytes for one time series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    bytes: Bytes,
}

impl PartitionKey {
    /// Serialize a label set. BTreeMap ordering makes the encoding canonical.
    pub fn from_labels(labels: &Labels) -> Self {
        let mut buf = BytesMut::new();
        buf.put_u16(labels.len() as u16);
        for (name, value) in labels {
            put_str(&mut buf, name);
            put_str(&mut buf, value);
        }
        Self {
            bytes: buf.freeze(),
        }
    }

    /// Wrap already-serialized key bytes (e.g. read back from the store).
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// The canonical byte form
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Decode back into a label map
    pub fn labels(&self) -> Result<Labels> {
        let mut buf = &self.bytes[..];
        let count = get_u16(&mut buf)? as usize;
        let mut labels = Labels::new();
        for _ in 0..count {
            let name = get_str(&mut buf)?;
            let value = get_str(&mut buf)?;
            labels.insert(name, value);
        }
        Ok(labels)
    }

    /// Stable hash of the key bytes; identical across processes and restarts.
    pub fn stable_hash(&self) -> u32 {
        crc32fast::hash(&self.bytes)
    }

    /// Shard owning this key out of `num_shards`
    pub fn shard(&self, num_shards: u32) -> u32 {
        self.stable_hash() % num_shards
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.len() < 2 {
        return Err(Error::RecordContainer("truncated partition key".into()));
    }
    let v = u16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(v)
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    let len = get_u16(buf)? as usize;
    if buf.len() < len {
        return Err(Error::RecordContainer("truncated partition key".into()));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| Error::RecordContainer("partition key not utf8".into()))?
        .to_string();
    *buf = &buf[len..];
    Ok(s)
}
