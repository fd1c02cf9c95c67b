//! Histogram column codec
//!
//! A chunk carries one bucket scheme in its header followed by per-bucket
//! columns of row-to-row deltas. Integral counts (the normal case) encode as
//! zigzag varints; a chunk falls back to raw f64 rows if any count is
//! fractional. Scheme changes within a partition force a new chunk; the
//! encoder rejects rows whose bounds differ from the header.

use super::varint::{get_varint, put_varint};
use crate::schema::HistogramValue;
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;

const ENCODING_VARINT: u8 = 0;
const ENCODING_RAW: u8 = 1;

/// Largest integer exactly representable in f64
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0; // 2^53

/// Append-only encoder for one histogram column
#[derive(Debug, Default)]
pub struct HistogramEncoder {
    bounds: Option<Arc<Vec<f64>>>,
    rows: Vec<Vec<f64>>,
}

impl HistogramEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `value`'s bucket scheme matches this chunk's scheme (or the
    /// chunk is still empty). A `false` answer means the partition must seal
    /// the current buffers before appending.
    pub fn accepts(&self, value: &HistogramValue) -> bool {
        match &self.bounds {
            None => true,
            Some(bounds) => **bounds == *value.bounds,
        }
    }

    /// Append one histogram row.
    pub fn append(&mut self, value: &HistogramValue) -> Result<()> {
        match &self.bounds {
            None => self.bounds = Some(value.bounds.clone()),
            Some(bounds) => {
                if **bounds != *value.bounds {
                    return Err(Error::SchemaMismatch(
                        "histogram bucket scheme changed mid-chunk".into(),
                    ));
                }
            }
        }
        self.rows.push(value.counts.clone());
        Ok(())
    }

    /// Rows appended so far
    pub fn num_rows(&self) -> u32 {
        self.rows.len() as u32
    }

    /// Seal into chunk bytes.
    pub fn encode(&self) -> Bytes {
        let bounds = self.bounds.as_deref().cloned().unwrap_or_default();
        let integral = self
            .rows
            .iter()
            .flatten()
            .all(|c| c.fract() == 0.0 && c.abs() < MAX_EXACT_INT);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(self.rows.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(bounds.len() as u16).to_be_bytes());
        for b in &bounds {
            buf.extend_from_slice(&b.to_bits().to_be_bytes());
        }
        buf.extend_from_slice(&[if integral { ENCODING_VARINT } else { ENCODING_RAW }]);

        if integral {
            let mut prev = vec![0i64; bounds.len()];
            for row in &self.rows {
                for (bucket, &count) in row.iter().enumerate() {
                    let v = count as i64;
                    put_varint(&mut buf, v - prev[bucket]);
                    prev[bucket] = v;
                }
            }
        } else {
            for row in &self.rows {
                for &count in row {
                    buf.extend_from_slice(&count.to_bits().to_be_bytes());
                }
            }
        }
        buf.freeze()
    }
}

/// Decoded reader over a sealed histogram chunk
#[derive(Debug)]
pub struct HistogramReader {
    bounds: Arc<Vec<f64>>,
    rows: Vec<Vec<f64>>,
}

impl HistogramReader {
    pub fn new(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.len() < 7 {
            return Err(Error::ChunkDecode("histogram chunk too short".into()));
        }
        let num_rows = buf.get_u32() as usize;
        let num_buckets = buf.get_u16() as usize;
        if buf.len() < num_buckets * 8 + 1 {
            return Err(Error::ChunkDecode("histogram chunk truncated".into()));
        }
        let mut bounds = Vec::with_capacity(num_buckets);
        for _ in 0..num_buckets {
            bounds.push(f64::from_bits(buf.get_u64()));
        }
        let encoding = buf.get_u8();

        let mut rows = Vec::with_capacity(num_rows);
        match encoding {
            ENCODING_VARINT => {
                let mut prev = vec![0i64; num_buckets];
                for _ in 0..num_rows {
                    let mut row = Vec::with_capacity(num_buckets);
                    for p in prev.iter_mut() {
                        *p += get_varint(&mut buf)?;
                        row.push(*p as f64);
                    }
                    rows.push(row);
                }
            }
            ENCODING_RAW => {
                for _ in 0..num_rows {
                    if buf.len() < num_buckets * 8 {
                        return Err(Error::ChunkDecode("histogram rows truncated".into()));
                    }
                    let mut row = Vec::with_capacity(num_buckets);
                    for _ in 0..num_buckets {
                        row.push(f64::from_bits(buf.get_u64()));
                    }
                    rows.push(row);
                }
            }
            other => {
                return Err(Error::ChunkDecode(format!(
                    "unknown histogram encoding {other}"
                )))
            }
        }
        Ok(Self {
            bounds: Arc::new(bounds),
            rows,
        })
    }

    /// Bucket upper bounds of this chunk's scheme
    pub fn bounds(&self) -> &Arc<Vec<f64>> {
        &self.bounds
    }

    /// Row count
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Random access to the histogram at `row`.
    pub fn apply(&self, row: usize) -> HistogramValue {
        HistogramValue::new(self.bounds.clone(), self.rows[row].clone())
    }

    /// Iterate histograms starting at `start_row`.
    pub fn iterate(&self, start_row: usize) -> impl Iterator<Item = HistogramValue> + '_ {
        (start_row..self.rows.len()).map(move |row| self.apply(row))
    }

    /// Bucket-wise sum over `[start_row, end_row]`, inclusive.
    pub fn sum(&self, start_row: usize, end_row: usize) -> HistogramValue {
        let mut counts = vec![0.0; self.bounds.len()];
        for row in &self.rows[start_row..=end_row] {
            for (acc, &c) in counts.iter_mut().zip(row) {
                *acc += c;
            }
        }
        HistogramValue::new(self.bounds.clone(), counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(bounds: &Arc<Vec<f64>>, counts: &[f64]) -> HistogramValue {
        HistogramValue::new(bounds.clone(), counts.to_vec())
    }

    #[test]
    fn integral_counts_roundtrip() {
        let bounds = Arc::new(vec![10.0, 100.0, f64::INFINITY]);
        let mut enc = HistogramEncoder::new();
        enc.append(&hist(&bounds, &[1.0, 5.0, 9.0])).unwrap();
        enc.append(&hist(&bounds, &[2.0, 6.0, 12.0])).unwrap();
        enc.append(&hist(&bounds, &[2.0, 8.0, 20.0])).unwrap();
        let reader = HistogramReader::new(&enc.encode()).unwrap();
        assert_eq!(reader.num_rows(), 3);
        assert_eq!(*reader.bounds().clone(), vec![10.0, 100.0, f64::INFINITY]);
        assert_eq!(reader.apply(1).counts, vec![2.0, 6.0, 12.0]);
    }

    #[test]
    fn fractional_counts_roundtrip_raw() {
        let bounds = Arc::new(vec![1.0, f64::INFINITY]);
        let mut enc = HistogramEncoder::new();
        enc.append(&hist(&bounds, &[0.5, 2.25])).unwrap();
        enc.append(&hist(&bounds, &[1.5, 4.75])).unwrap();
        let reader = HistogramReader::new(&enc.encode()).unwrap();
        assert_eq!(reader.apply(0).counts, vec![0.5, 2.25]);
        assert_eq!(reader.apply(1).counts, vec![1.5, 4.75]);
    }

    #[test]
    fn scheme_change_is_rejected() {
        let bounds = Arc::new(vec![10.0, f64::INFINITY]);
        let other = Arc::new(vec![10.0, 50.0, f64::INFINITY]);
        let mut enc = HistogramEncoder::new();
        enc.append(&hist(&bounds, &[1.0, 2.0])).unwrap();
        assert!(!enc.accepts(&hist(&other, &[1.0, 2.0, 3.0])));
        assert!(enc.append(&hist(&other, &[1.0, 2.0, 3.0])).is_err());
    }

    #[test]
    fn sum_is_bucketwise() {
        let bounds = Arc::new(vec![10.0, f64::INFINITY]);
        let mut enc = HistogramEncoder::new();
        enc.append(&hist(&bounds, &[1.0, 2.0])).unwrap();
        enc.append(&hist(&bounds, &[3.0, 4.0])).unwrap();
        let reader = HistogramReader::new(&enc.encode()).unwrap();
        assert_eq!(reader.sum(0, 1).counts, vec![4.0, 6.0]);
    }

    #[test]
    fn counter_reset_produces_negative_deltas() {
        let bounds = Arc::new(vec![f64::INFINITY]);
        let mut enc = HistogramEncoder::new();
        enc.append(&hist(&bounds, &[100.0])).unwrap();
        enc.append(&hist(&bounds, &[3.0])).unwrap();
        let reader = HistogramReader::new(&enc.encode()).unwrap();
        assert_eq!(reader.apply(1).counts, vec![3.0]);
    }
}
