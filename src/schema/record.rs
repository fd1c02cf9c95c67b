//! Binary record containers
//!
//! The ingestion source hands each shard a `RecordContainer`: a checksummed,
//! length-prefixed concatenation of fixed-schema binary records with embedded
//! timestamps. Containers are self-describing enough to be replayed from the
//! source queue; the crc32 guards the whole payload.

use super::{ColumnType, HistogramValue, PartitionKey, Schema};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// One decoded ingest row
#[derive(Debug, Clone)]
pub struct IngestRecord {
    /// Partition key of the series this row belongs to
    pub part_key: PartitionKey,
    /// Sample timestamp, millis
    pub timestamp: i64,
    /// Value-column payloads in schema order
    pub values: Vec<FieldValue>,
}

/// A single value-column payload
#[derive(Debug, Clone)]
pub enum FieldValue {
    Double(f64),
    Histogram(HistogramValue),
    Utf8(String),
}

/// Builder accumulating records for one shard
pub struct RecordBuilder {
    schema: Arc<Schema>,
    buf: BytesMut,
    count: u32,
}

impl RecordBuilder {
    /// Create a builder for the given schema
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            buf: BytesMut::new(),
            count: 0,
        }
    }

    /// Append one row. Values must match the schema's value columns in order.
    pub fn add_record(
        &mut self,
        part_key: &PartitionKey,
        timestamp: i64,
        values: &[FieldValue],
    ) -> Result<()> {
        let data_cols = self.schema.data_columns();
        if values.len() != data_cols.len() {
            return Err(Error::SchemaMismatch(format!(
                "expected {} values, got {}",
                data_cols.len(),
                values.len()
            )));
        }
        for (col, value) in data_cols.iter().zip(values) {
            let ok = matches!(
                (col.column_type, value),
                (ColumnType::Double, FieldValue::Double(_))
                    | (ColumnType::Histogram, FieldValue::Histogram(_))
                    | (ColumnType::Utf8, FieldValue::Utf8(_))
            );
            if !ok {
                return Err(Error::SchemaMismatch(format!(
                    "column {} expects {:?}",
                    col.name, col.column_type
                )));
            }
        }

        let key_bytes = part_key.as_bytes();
        self.buf.put_u16(key_bytes.len() as u16);
        self.buf.put_slice(key_bytes);
        self.buf.put_i64(timestamp);
        for value in values {
            match value {
                FieldValue::Double(d) => self.buf.put_u64(d.to_bits()),
                FieldValue::Histogram(h) => {
                    self.buf.put_u16(h.num_buckets() as u16);
                    for b in h.bounds.iter() {
                        self.buf.put_f64(*b);
                    }
                    for c in &h.counts {
                        self.buf.put_f64(*c);
                    }
                }
                FieldValue::Utf8(s) => {
                    self.buf.put_u16(s.len() as u16);
                    self.buf.put_slice(s.as_bytes());
                }
            }
        }
        self.count += 1;
        Ok(())
    }

    /// Convenience for single-double schemas (gauges, counters).
    pub fn add_sample(&mut self, part_key: &PartitionKey, timestamp: i64, value: f64) -> Result<()> {
        self.add_record(part_key, timestamp, &[FieldValue::Double(value)])
    }

    /// Number of records added so far
    pub fn record_count(&self) -> u32 {
        self.count
    }

    /// Seal into an immutable container.
    pub fn build(self) -> RecordContainer {
        let payload = self.buf.freeze();
        let crc = crc32fast::hash(&payload);
        let mut framed = BytesMut::with_capacity(payload.len() + 8);
        framed.put_u32(crc);
        framed.put_u32(self.count);
        framed.put_slice(&payload);
        RecordContainer {
            schema: self.schema,
            bytes: framed.freeze(),
        }
    }
}

/// Immutable, checksummed batch of ingest records
#[derive(Debug, Clone)]
pub struct RecordContainer {
    schema: Arc<Schema>,
    bytes: Bytes,
}

impl RecordContainer {
    /// Rehydrate a container from wire bytes.
    pub fn from_bytes(schema: Arc<Schema>, bytes: Bytes) -> Result<Self> {
        let container = Self { schema, bytes };
        container.verify()?;
        Ok(container)
    }

    /// The schema records were built against
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Number of records in the container
    pub fn record_count(&self) -> Result<u32> {
        if self.bytes.len() < 8 {
            return Err(Error::RecordContainer("container shorter than header".into()));
        }
        Ok(u32::from_be_bytes(self.bytes[4..8].try_into().unwrap()))
    }

    /// Raw framed bytes (for forwarding to another shard or queue)
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    fn verify(&self) -> Result<()> {
        if self.bytes.len() < 8 {
            return Err(Error::RecordContainer("container shorter than header".into()));
        }
        let stored = u32::from_be_bytes(self.bytes[0..4].try_into().unwrap());
        let actual = crc32fast::hash(&self.bytes[8..]);
        if stored != actual {
            return Err(Error::RecordContainer(format!(
                "crc mismatch: stored {stored:#x}, computed {actual:#x}"
            )));
        }
        Ok(())
    }

    /// Decode all records. Fails on the first malformed record.
    pub fn records(&self) -> Result<Vec<IngestRecord>> {
        self.verify()?;
        let count = self.record_count()? as usize;
        let mut buf = self.bytes.slice(8..);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_record(&mut buf)?);
        }
        Ok(out)
    }

    fn read_record(&self, buf: &mut Bytes) -> Result<IngestRecord> {
        let key_len = read_u16(buf)? as usize;
        if buf.len() < key_len {
            return Err(Error::RecordContainer("truncated record key".into()));
        }
        let part_key = PartitionKey::from_bytes(buf.split_to(key_len));
        if buf.len() < 8 {
            return Err(Error::RecordContainer("truncated record timestamp".into()));
        }
        let timestamp = buf.get_i64();

        let mut values = Vec::with_capacity(self.schema.data_columns().len());
        for col in self.schema.data_columns() {
            let value = match col.column_type {
                ColumnType::Double => {
                    if buf.len() < 8 {
                        return Err(Error::RecordContainer("truncated double value".into()));
                    }
                    FieldValue::Double(f64::from_bits(buf.get_u64()))
                }
                ColumnType::Histogram => {
                    let n = read_u16(buf)? as usize;
                    if buf.len() < n * 16 {
                        return Err(Error::RecordContainer("truncated histogram value".into()));
                    }
                    let mut bounds = Vec::with_capacity(n);
                    for _ in 0..n {
                        bounds.push(buf.get_f64());
                    }
                    let mut counts = Vec::with_capacity(n);
                    for _ in 0..n {
                        counts.push(buf.get_f64());
                    }
                    FieldValue::Histogram(HistogramValue::new(Arc::new(bounds), counts))
                }
                ColumnType::Utf8 => {
                    let len = read_u16(buf)? as usize;
                    if buf.len() < len {
                        return Err(Error::RecordContainer("truncated utf8 value".into()));
                    }
                    let raw = buf.split_to(len);
                    FieldValue::Utf8(
                        std::str::from_utf8(&raw)
                            .map_err(|_| Error::RecordContainer("value not utf8".into()))?
                            .to_string(),
                    )
                }
                other => {
                    return Err(Error::SchemaMismatch(format!(
                        "column type {other:?} not supported in record containers"
                    )))
                }
            };
            values.push(value);
        }
        Ok(IngestRecord {
            part_key,
            timestamp,
            values,
        })
    }
}

fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.len() < 2 {
        return Err(Error::RecordContainer("truncated length prefix".into()));
    }
    Ok(buf.get_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Labels;

    fn part_key(app: &str) -> PartitionKey {
        let mut labels = Labels::new();
        labels.insert("__name__".into(), "heap_usage".into());
        labels.insert("app".into(), app.into());
        PartitionKey::from_labels(&labels)
    }

    #[test]
    fn build_and_decode_gauge_records() {
        let schema = Schema::prom_gauge();
        let mut builder = RecordBuilder::new(schema.clone());
        let key = part_key("x");
        for i in 0..10 {
            builder.add_sample(&key, 1000 + i * 10, i as f64).unwrap();
        }
        let container = builder.build();
        let records = container.records().unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[3].timestamp, 1030);
        assert!(matches!(records[3].values[0], FieldValue::Double(v) if v == 3.0));
        assert_eq!(records[0].part_key, key);
    }

    #[test]
    fn histogram_records_roundtrip() {
        let schema = Schema::prom_histogram();
        let mut builder = RecordBuilder::new(schema.clone());
        let key = part_key("h");
        let hist = HistogramValue::new(
            Arc::new(vec![10.0, 100.0, f64::INFINITY]),
            vec![1.0, 4.0, 5.0],
        );
        builder
            .add_record(&key, 1000, &[FieldValue::Histogram(hist.clone())])
            .unwrap();
        let records = builder.build().records().unwrap();
        assert!(matches!(&records[0].values[0], FieldValue::Histogram(h) if *h == hist));
    }

    #[test]
    fn corrupt_container_fails_crc() {
        let schema = Schema::prom_gauge();
        let mut builder = RecordBuilder::new(schema.clone());
        builder.add_sample(&part_key("x"), 1000, 1.0).unwrap();
        let container = builder.build();

        let mut bytes = container.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(RecordContainer::from_bytes(schema, Bytes::from(bytes)).is_err());
    }

    #[test]
    fn wrong_value_kind_is_schema_mismatch() {
        let schema = Schema::prom_gauge();
        let mut builder = RecordBuilder::new(schema);
        let err = builder
            .add_record(&part_key("x"), 1000, &[FieldValue::Utf8("oops".into())])
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }
}
