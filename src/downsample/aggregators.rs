//! Per-column downsamplers
//!
//! Each downsampler folds one period's row range `[start_row, end_row]` of a
//! source chunk into a single output value. NaN never enters an aggregate:
//! min/max skip it, sum/count omit it.

use crate::chunk::ChunkSetReader;
use crate::schema::{DownsamplerKind, DownsamplerSpec, HistogramValue};
use crate::{Error, Result};

/// One downsampled output value
#[derive(Debug, Clone, PartialEq)]
pub enum DownsampledValue {
    Timestamp(i64),
    Double(f64),
    Histogram(HistogramValue),
}

/// Apply one downsampler spec to `[start_row, end_row]` of a source chunk.
pub fn downsample_period(
    spec: &DownsamplerSpec,
    reader: &ChunkSetReader,
    start_row: usize,
    end_row: usize,
) -> Result<DownsampledValue> {
    let input = |ix: usize| -> Result<u16> {
        spec.inputs.get(ix).copied().ok_or_else(|| {
            Error::SchemaMismatch(format!(
                "{:?} downsampler needs input column {ix}",
                spec.kind
            ))
        })
    };
    Ok(match spec.kind {
        DownsamplerKind::Timestamp => {
            DownsampledValue::Timestamp(reader.timestamps()?.apply(end_row))
        }
        DownsamplerKind::Min => {
            let doubles = reader.doubles(input(0)?)?;
            DownsampledValue::Double(fold_skip_nan(
                (start_row..=end_row).map(|r| doubles.apply(r)),
                f64::min,
                f64::INFINITY,
            ))
        }
        DownsamplerKind::Max => {
            let doubles = reader.doubles(input(0)?)?;
            DownsampledValue::Double(fold_skip_nan(
                (start_row..=end_row).map(|r| doubles.apply(r)),
                f64::max,
                f64::NEG_INFINITY,
            ))
        }
        DownsamplerKind::Sum => {
            let doubles = reader.doubles(input(0)?)?;
            DownsampledValue::Double(doubles.sum(start_row, end_row))
        }
        DownsamplerKind::Count => {
            let doubles = reader.doubles(input(0)?)?;
            DownsampledValue::Double(doubles.count(start_row, end_row) as f64)
        }
        DownsamplerKind::Avg => {
            let doubles = reader.doubles(input(0)?)?;
            let count = doubles.count(start_row, end_row);
            DownsampledValue::Double(if count == 0 {
                f64::NAN
            } else {
                doubles.sum(start_row, end_row) / count as f64
            })
        }
        DownsamplerKind::AvgFromAvgCount => {
            let avgs = reader.doubles(input(0)?)?;
            let counts = reader.doubles(input(1)?)?;
            let mut avg = 0.0;
            let mut count = 0.0;
            for row in start_row..=end_row {
                let next_avg = avgs.apply(row);
                let next_count = counts.apply(row);
                if next_avg.is_nan() || next_count.is_nan() || next_count == 0.0 {
                    continue;
                }
                // running merge: avg' = (avg*cnt + nextAvg*nextCnt) / (cnt+nextCnt)
                avg = (avg * count + next_avg * next_count) / (count + next_count);
                count += next_count;
            }
            DownsampledValue::Double(if count == 0.0 { f64::NAN } else { avg })
        }
        DownsamplerKind::AvgFromSumCount => {
            let sums = reader.doubles(input(0)?)?;
            let counts = reader.doubles(input(1)?)?;
            let sum = sums.sum(start_row, end_row);
            let count = counts.sum(start_row, end_row);
            DownsampledValue::Double(if count == 0.0 { f64::NAN } else { sum / count })
        }
        DownsamplerKind::LastValue => {
            let doubles = reader.doubles(input(0)?)?;
            DownsampledValue::Double(doubles.apply(end_row))
        }
        DownsamplerKind::HistogramSum => {
            let hists = reader.histograms(input(0)?)?;
            DownsampledValue::Histogram(hists.sum(start_row, end_row))
        }
    })
}

fn fold_skip_nan(values: impl Iterator<Item = f64>, f: impl Fn(f64, f64) -> f64, init: f64) -> f64 {
    let mut acc = init;
    let mut any = false;
    for v in values {
        if v.is_nan() {
            continue;
        }
        acc = f(acc, v);
        any = true;
    }
    if any {
        acc
    } else {
        f64::NAN
    }
}
