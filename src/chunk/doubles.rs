//! Double column codec: XOR-compressed floats with counter-dip tracking
//!
//! The bit scheme follows the Gorilla paper. NaN survives bitwise since the
//! codec works on raw bit patterns. While appending, the encoder watches for
//! values strictly below their predecessor; each such dip sets the `dropped`
//! flag and records the row index where the drop begins, which the counter
//! period marker later consumes.

use super::bitstream::{BitReader, BitWriter};
use super::varint::{get_uvarint, put_uvarint};
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};

const FLAG_DROPPED: u8 = 1;

/// Append-only XOR encoder for one double column
#[derive(Debug)]
pub struct DoubleEncoder {
    bits: BitWriter,
    prev_bits: u64,
    prev_value: f64,
    leading: u8,
    trailing: u8,
    num_rows: u32,
    dropped: bool,
    drop_positions: Vec<u32>,
}

impl Default for DoubleEncoder {
    fn default() -> Self {
        Self {
            bits: BitWriter::with_capacity(512),
            prev_bits: 0,
            prev_value: 0.0,
            leading: 0xff, // sentinel: no window established yet
            trailing: 0,
            num_rows: 0,
            dropped: false,
            drop_positions: Vec::new(),
        }
    }
}

impl DoubleEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one value.
    pub fn append(&mut self, value: f64) {
        if self.num_rows == 0 {
            self.bits.write_bits(value.to_bits(), 64);
        } else {
            // NaN comparisons are false, so NaN neither drops nor is dropped on
            if value < self.prev_value {
                self.dropped = true;
                self.drop_positions.push(self.num_rows);
            }
            self.write_xor(value.to_bits());
        }
        self.prev_bits = value.to_bits();
        self.prev_value = value;
        self.num_rows += 1;
    }

    fn write_xor(&mut self, bits: u64) {
        let xor = bits ^ self.prev_bits;
        if xor == 0 {
            self.bits.write_bit(false);
            return;
        }
        self.bits.write_bit(true);

        let leading = (xor.leading_zeros() as u8).min(31);
        let trailing = xor.trailing_zeros() as u8;

        if self.leading != 0xff && leading >= self.leading && trailing >= self.trailing {
            self.bits.write_bit(false);
            let sigbits = 64 - self.leading - self.trailing;
            self.bits.write_bits(xor >> self.trailing, sigbits);
        } else {
            self.leading = leading;
            self.trailing = trailing;
            self.bits.write_bit(true);
            self.bits.write_bits(leading as u64, 5);
            let sigbits = 64 - leading - trailing;
            // 64 significant bits encode as 0 in the 6-bit field
            let sig_field = if sigbits == 64 { 0 } else { sigbits };
            self.bits.write_bits(sig_field as u64, 6);
            self.bits.write_bits(xor >> trailing, sigbits);
        }
    }

    /// Rows appended so far
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// Seal into chunk bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&self.num_rows.to_be_bytes());
        buf.extend_from_slice(&[if self.dropped { FLAG_DROPPED } else { 0 }]);
        put_uvarint(&mut buf, self.drop_positions.len() as u64);
        let mut prev = 0u32;
        for &pos in &self.drop_positions {
            put_uvarint(&mut buf, (pos - prev) as u64);
            prev = pos;
        }
        buf.extend_from_slice(self.bits.bytes());
        buf.freeze()
    }
}

/// Decoded reader over a sealed double chunk
#[derive(Debug)]
pub struct DoubleReader {
    values: Vec<f64>,
    dropped: bool,
    drop_positions: Vec<usize>,
}

impl DoubleReader {
    pub fn new(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.len() < 5 {
            return Err(Error::ChunkDecode("double chunk too short".into()));
        }
        let num_rows = buf.get_u32() as usize;
        let flags = buf.get_u8();
        let num_drops = get_uvarint(&mut buf)? as usize;
        let mut drop_positions = Vec::with_capacity(num_drops);
        let mut prev = 0u64;
        for _ in 0..num_drops {
            prev += get_uvarint(&mut buf)?;
            drop_positions.push(prev as usize);
        }

        let mut values = Vec::with_capacity(num_rows);
        let mut bits = BitReader::new(buf);
        let mut prev_bits = 0u64;
        let mut leading = 0u8;
        let mut trailing = 0u8;
        for row in 0..num_rows {
            let value_bits = if row == 0 {
                bits.read_bits(64)?
            } else if !bits.read_bit()? {
                prev_bits
            } else {
                if bits.read_bit()? {
                    leading = bits.read_bits(5)? as u8;
                    let sig = bits.read_bits(6)? as u8;
                    trailing = 64 - leading - if sig == 0 { 64 } else { sig };
                }
                let sigbits = 64 - leading - trailing;
                let xor = bits.read_bits(sigbits)? << trailing;
                prev_bits ^ xor
            };
            prev_bits = value_bits;
            values.push(f64::from_bits(value_bits));
        }
        Ok(Self {
            values,
            dropped: flags & FLAG_DROPPED != 0,
            drop_positions,
        })
    }

    /// Row count
    pub fn num_rows(&self) -> usize {
        self.values.len()
    }

    /// Random access to the value at `row`.
    pub fn apply(&self, row: usize) -> f64 {
        self.values[row]
    }

    /// Iterate values starting at `start_row`.
    pub fn iterate(&self, start_row: usize) -> impl Iterator<Item = f64> + '_ {
        self.values[start_row..].iter().copied()
    }

    /// Sum of non-NaN values over `[start_row, end_row]`, inclusive.
    pub fn sum(&self, start_row: usize, end_row: usize) -> f64 {
        self.values[start_row..=end_row]
            .iter()
            .filter(|v| !v.is_nan())
            .sum()
    }

    /// Count of non-NaN values over `[start_row, end_row]`, inclusive.
    pub fn count(&self, start_row: usize, end_row: usize) -> usize {
        self.values[start_row..=end_row]
            .iter()
            .filter(|v| !v.is_nan())
            .count()
    }

    /// Whether any appended value dipped below its predecessor
    pub fn dropped(&self) -> bool {
        self.dropped
    }

    /// Sorted row indices where a drop begins
    pub fn drop_positions(&self) -> &[usize] {
        &self.drop_positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[f64]) -> DoubleReader {
        let mut enc = DoubleEncoder::new();
        for &v in values {
            enc.append(v);
        }
        DoubleReader::new(&enc.encode()).unwrap()
    }

    #[test]
    fn bitwise_roundtrip() {
        let values = vec![
            1.0,
            1.0,
            2.5,
            -17.25,
            0.0,
            -0.0,
            f64::MAX,
            f64::MIN_POSITIVE,
            3.14159,
        ];
        let reader = roundtrip(&values);
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(reader.apply(i).to_bits(), v.to_bits(), "row {i}");
        }
    }

    #[test]
    fn nan_bit_patterns_survive() {
        let quiet = f64::NAN;
        let payload = f64::from_bits(0x7ff8_0000_0000_beef);
        let reader = roundtrip(&[1.0, quiet, payload, 2.0]);
        assert_eq!(reader.apply(1).to_bits(), quiet.to_bits());
        assert_eq!(reader.apply(2).to_bits(), payload.to_bits());
        assert!(!reader.dropped(), "NaN must not register as a drop");
    }

    #[test]
    fn drops_are_detected_and_positioned() {
        let reader = roundtrip(&[1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 1.5]);
        assert!(reader.dropped());
        assert_eq!(reader.drop_positions(), &[3, 6]);
    }

    #[test]
    fn monotonic_values_have_no_drops() {
        let reader = roundtrip(&[1.0, 1.0, 2.0, 5.0]);
        assert!(!reader.dropped());
        assert!(reader.drop_positions().is_empty());
    }

    #[test]
    fn sum_and_count_skip_nan() {
        let reader = roundtrip(&[1.0, f64::NAN, 2.0, 3.0, f64::NAN]);
        assert_eq!(reader.sum(0, 4), 6.0);
        assert_eq!(reader.count(0, 4), 3);
        assert_eq!(reader.sum(1, 1), 0.0);
        assert_eq!(reader.count(1, 1), 0);
    }

    #[test]
    fn long_series_roundtrip() {
        let values: Vec<f64> = (0..2000).map(|i| (i as f64 * 0.1).sin() * 100.0).collect();
        let reader = roundtrip(&values);
        let decoded: Vec<f64> = reader.iterate(0).collect();
        assert_eq!(decoded, values);
    }
}
