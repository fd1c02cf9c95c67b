//! Timestamp column codec: delta-of-delta with run-length segments
//!
//! Regularly spaced samples collapse into a handful of (start, delta, count)
//! segments, so appends are O(1) and `ceiling_index` is a binary search over
//! segments rather than rows.

use super::varint::{get_uvarint, get_varint, put_uvarint, put_varint};
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};

#[derive(Debug, Clone, Copy)]
struct Segment {
    /// First timestamp of the segment
    start: i64,
    /// Spacing between consecutive rows
    delta: i64,
    /// Rows in the segment
    count: u32,
}

impl Segment {
    fn last(&self) -> i64 {
        self.start + self.delta * (self.count as i64 - 1)
    }
}

/// Append-only encoder for strictly increasing timestamps
#[derive(Debug, Default)]
pub struct TimestampEncoder {
    segments: Vec<Segment>,
    last: i64,
    num_rows: u32,
}

impl TimestampEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one timestamp. Callers enforce monotonicity; the encoder only
    /// debug-asserts it.
    pub fn append(&mut self, ts: i64) {
        debug_assert!(self.num_rows == 0 || ts > self.last);
        match self.segments.last_mut() {
            None => self.segments.push(Segment {
                start: ts,
                delta: 0,
                count: 1,
            }),
            Some(seg) => {
                let delta = ts - self.last;
                if seg.count == 1 {
                    seg.delta = delta;
                    seg.count = 2;
                } else if seg.delta == delta {
                    seg.count += 1;
                } else {
                    self.segments.push(Segment {
                        start: ts,
                        delta: 0,
                        count: 1,
                    });
                }
            }
        }
        self.last = ts;
        self.num_rows += 1;
    }

    /// Rows appended so far
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// Seal into chunk bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&self.num_rows.to_be_bytes());
        put_uvarint(&mut buf, self.segments.len() as u64);
        let mut prev_start = 0i64;
        for seg in &self.segments {
            put_varint(&mut buf, seg.start - prev_start);
            put_uvarint(&mut buf, seg.delta as u64);
            put_uvarint(&mut buf, seg.count as u64);
            prev_start = seg.start;
        }
        buf.freeze()
    }
}

/// Decoded reader over a sealed timestamp chunk
#[derive(Debug)]
pub struct TimestampReader {
    segments: Vec<Segment>,
    /// Row index of each segment's first row
    row_offsets: Vec<u32>,
    num_rows: u32,
}

impl TimestampReader {
    pub fn new(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.len() < 4 {
            return Err(Error::ChunkDecode("timestamp chunk too short".into()));
        }
        let num_rows = buf.get_u32();
        let num_segments = get_uvarint(&mut buf)? as usize;
        let mut segments = Vec::with_capacity(num_segments);
        let mut row_offsets = Vec::with_capacity(num_segments);
        let mut prev_start = 0i64;
        let mut rows = 0u32;
        for _ in 0..num_segments {
            let start = prev_start + get_varint(&mut buf)?;
            let delta = get_uvarint(&mut buf)? as i64;
            let count = get_uvarint(&mut buf)? as u32;
            row_offsets.push(rows);
            segments.push(Segment {
                start,
                delta,
                count,
            });
            rows += count;
            prev_start = start;
        }
        if rows != num_rows {
            return Err(Error::ChunkDecode(format!(
                "timestamp chunk rows mismatch: header {num_rows}, segments {rows}"
            )));
        }
        Ok(Self {
            segments,
            row_offsets,
            num_rows,
        })
    }

    /// Row count
    pub fn num_rows(&self) -> usize {
        self.num_rows as usize
    }

    /// Random access to the timestamp at `row`.
    pub fn apply(&self, row: usize) -> i64 {
        debug_assert!(row < self.num_rows as usize);
        let seg_ix = match self.row_offsets.binary_search(&(row as u32)) {
            Ok(ix) => ix,
            Err(ix) => ix - 1,
        };
        let seg = &self.segments[seg_ix];
        let offset = row as i64 - self.row_offsets[seg_ix] as i64;
        seg.start + seg.delta * offset
    }

    /// Iterate timestamps starting at `start_row`.
    pub fn iterate(&self, start_row: usize) -> impl Iterator<Item = i64> + '_ {
        (start_row..self.num_rows as usize).map(move |row| self.apply(row))
    }

    /// Greatest row whose timestamp is `<= ts`, or `None` if every row is
    /// later. O(log segments).
    pub fn ceiling_index(&self, ts: i64) -> Option<usize> {
        if self.num_rows == 0 || self.segments[0].start > ts {
            return None;
        }
        // Last segment whose start <= ts
        let seg_ix = self.segments.partition_point(|s| s.start <= ts) - 1;
        let seg = &self.segments[seg_ix];
        let k = if seg.delta > 0 {
            ((ts - seg.start) / seg.delta).min(seg.count as i64 - 1)
        } else {
            seg.count as i64 - 1
        };
        Some(self.row_offsets[seg_ix] as usize + k as usize)
    }

    /// First timestamp in the chunk
    pub fn first(&self) -> i64 {
        self.segments[0].start
    }

    /// Last timestamp in the chunk
    pub fn last(&self) -> i64 {
        self.segments.last().map(|s| s.last()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(timestamps: &[i64]) -> TimestampReader {
        let mut enc = TimestampEncoder::new();
        for &ts in timestamps {
            enc.append(ts);
        }
        TimestampReader::new(&enc.encode()).unwrap()
    }

    #[test]
    fn regular_spacing_roundtrip() {
        let timestamps: Vec<i64> = (0..720).map(|i| 1_000_000 + i * 10_000).collect();
        let reader = encode(&timestamps);
        assert_eq!(reader.num_rows(), 720);
        let decoded: Vec<i64> = reader.iterate(0).collect();
        assert_eq!(decoded, timestamps);
    }

    #[test]
    fn irregular_spacing_roundtrip() {
        let timestamps = vec![5, 17, 29, 30, 31, 32, 1000, 5000, 9000];
        let reader = encode(&timestamps);
        let decoded: Vec<i64> = reader.iterate(0).collect();
        assert_eq!(decoded, timestamps);
        assert_eq!(reader.apply(6), 1000);
    }

    #[test]
    fn ceiling_index_finds_greatest_row_at_or_before() {
        let timestamps: Vec<i64> = (0..10).map(|i| 100 + i * 10).collect();
        let reader = encode(&timestamps);
        assert_eq!(reader.ceiling_index(99), None);
        assert_eq!(reader.ceiling_index(100), Some(0));
        assert_eq!(reader.ceiling_index(105), Some(0));
        assert_eq!(reader.ceiling_index(110), Some(1));
        assert_eq!(reader.ceiling_index(189), Some(8));
        assert_eq!(reader.ceiling_index(1_000_000), Some(9));
    }

    #[test]
    fn iterate_from_offset() {
        let timestamps = vec![10, 20, 30, 40];
        let reader = encode(&timestamps);
        let tail: Vec<i64> = reader.iterate(2).collect();
        assert_eq!(tail, vec![30, 40]);
    }

    #[test]
    fn first_and_last() {
        let reader = encode(&[7, 19, 22]);
        assert_eq!(reader.first(), 7);
        assert_eq!(reader.last(), 22);
    }
}
