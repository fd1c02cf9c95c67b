//! Downsample period markers
//!
//! A period marker decides which row indices terminate each downsample
//! period within one source chunk. The default marker cuts on resolution
//! boundaries; the counter marker adds the chunk's first row and a pair of
//! rows around every counter drop so rate computations stay correct across
//! chunk and reset boundaries.

use crate::chunk::{DoubleReader, TimestampReader};
use crate::schema::ColumnDef;
use crate::{Error, Result};

/// Row indices ending each period for resolution `resolution_ms`.
///
/// Period `k` ends at the greatest row whose timestamp is at or before
/// `(floor((start - 1) / R) + 1 + k) * R`: right-inclusive, so a sample at
/// exactly `t = k * R` belongs to period `k`.
pub fn default_periods(timestamps: &TimestampReader, resolution_ms: i64) -> Vec<usize> {
    let mut ends = Vec::new();
    if timestamps.num_rows() == 0 {
        return ends;
    }
    let start = timestamps.first();
    let last = timestamps.last();
    let mut boundary = ((start - 1).div_euclid(resolution_ms) + 1) * resolution_ms;
    loop {
        if let Some(row) = timestamps.ceiling_index(boundary) {
            if ends.last() != Some(&row) {
                ends.push(row);
            }
        }
        if boundary >= last {
            break;
        }
        boundary += resolution_ms;
    }
    ends
}

/// Counter marker: the default period ends, plus the chunk's first row, plus
/// `(d - 1, d)` for every drop position `d` so each reset keeps its
/// before/after values in separate periods.
pub fn counter_periods(
    column: &ColumnDef,
    timestamps: &TimestampReader,
    doubles: &DoubleReader,
    resolution_ms: i64,
) -> Result<Vec<usize>> {
    if !column.counter {
        return Err(Error::PeriodMarkerMismatch(format!(
            "column {} is not a counter",
            column.name
        )));
    }
    let mut ends = default_periods(timestamps, resolution_ms);
    if timestamps.num_rows() == 0 {
        return Ok(ends);
    }
    ends.push(0);
    if doubles.dropped() {
        for &d in doubles.drop_positions() {
            ends.push(d);
            if d > 0 {
                ends.push(d - 1);
            }
        }
    }
    ends.sort_unstable();
    ends.dedup();
    Ok(ends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{DoubleEncoder, TimestampEncoder};
    use crate::schema::{ColumnDef, ColumnType};

    fn ts_reader(timestamps: &[i64]) -> TimestampReader {
        let mut enc = TimestampEncoder::new();
        for &t in timestamps {
            enc.append(t);
        }
        TimestampReader::new(&enc.encode()).unwrap()
    }

    fn double_reader(values: &[f64]) -> DoubleReader {
        let mut enc = DoubleEncoder::new();
        for &v in values {
            enc.append(v);
        }
        DoubleReader::new(&enc.encode()).unwrap()
    }

    #[test]
    fn default_marker_single_period() {
        // 60 samples at 1s spacing starting at 1s: all in one 60s period
        let timestamps: Vec<i64> = (0..60).map(|i| 1000 + i * 1000).collect();
        let reader = ts_reader(&timestamps);
        assert_eq!(default_periods(&reader, 60_000), vec![59]);
    }

    #[test]
    fn default_marker_boundary_sample_belongs_left() {
        // samples at 30s, 60s, 90s with R=60s: 60s ends period 0
        let reader = ts_reader(&[30_000, 60_000, 90_000]);
        assert_eq!(default_periods(&reader, 60_000), vec![1, 2]);
    }

    #[test]
    fn default_marker_covers_rows_contiguously() {
        let timestamps: Vec<i64> = (0..300).map(|i| 7_777 + i * 1_000).collect();
        let reader = ts_reader(&timestamps);
        let ends = default_periods(&reader, 60_000);
        // partitions rows into consecutive ranges ending at the last row
        assert_eq!(*ends.last().unwrap(), 299);
        for pair in ends.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // boundaries align: each non-final end row is the last one <= k*R
        for &end in &ends[..ends.len() - 1] {
            let ts = reader.apply(end);
            let next_ts = reader.apply(end + 1);
            assert!(next_ts.div_euclid(60_000) > (ts - 1).div_euclid(60_000));
        }
    }

    #[test]
    fn counter_marker_includes_first_row_and_drop_pairs() {
        let timestamps: Vec<i64> = (0..10).map(|i| 1000 + i * 1000).collect();
        let reader = ts_reader(&timestamps);
        // drop at row 4 (3.0 -> 0.0) within one period
        let doubles = double_reader(&[0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let column = ColumnDef::new(1, "value", ColumnType::Double).counter();
        let ends = counter_periods(&column, &reader, &doubles, 60_000).unwrap();
        assert!(ends.contains(&0), "chunk start always marked");
        assert!(ends.contains(&3) && ends.contains(&4), "drop pair marked");
        assert_eq!(*ends.last().unwrap(), 9);
    }

    #[test]
    fn counter_marker_drop_at_first_row_does_not_underflow() {
        let reader = ts_reader(&[1000, 2000]);
        // no drop possible at row 0, but exercise a drop at row 1
        let doubles = double_reader(&[5.0, 1.0]);
        let column = ColumnDef::new(1, "value", ColumnType::Double).counter();
        let ends = counter_periods(&column, &reader, &doubles, 60_000).unwrap();
        assert_eq!(ends, vec![0, 1]);
    }

    #[test]
    fn counter_marker_rejects_gauge_column() {
        let reader = ts_reader(&[1000]);
        let doubles = double_reader(&[1.0]);
        let column = ColumnDef::new(1, "value", ColumnType::Double);
        assert!(matches!(
            counter_periods(&column, &reader, &doubles, 60_000),
            Err(Error::PeriodMarkerMismatch(_))
        ));
    }
}
