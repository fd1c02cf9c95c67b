//! Range-vector window functions
//!
//! Sliding implementations evaluate one window of raw samples at a time.
//! Counter functions (`rate`, `irate`, `increase`) apply reset correction and
//! the standard boundary extrapolation. The chunked accumulator covers the
//! associative `*_over_time` functions using the chunk readers' range
//! primitives instead of materialized rows.

use super::logical::RangeFunction;
use super::rangevector::Sample;
use crate::chunk::DoubleReader;

/// Evaluate `function` over the samples inside the window
/// `(window_start, window_end]`. Returns NaN when the window has no answer.
pub fn evaluate(function: &RangeFunction, samples: &[Sample], window_start: i64, window_end: i64) -> f64 {
    match function {
        RangeFunction::Last => samples.last().map(|s| s.value).unwrap_or(f64::NAN),
        RangeFunction::Rate => extrapolated(samples, window_start, window_end, true, true),
        RangeFunction::Increase => extrapolated(samples, window_start, window_end, true, false),
        RangeFunction::Delta => extrapolated(samples, window_start, window_end, false, false),
        RangeFunction::Irate => irate(samples),
        RangeFunction::SumOverTime => fold_defined(samples, |acc, v| acc + v, 0.0),
        RangeFunction::CountOverTime => {
            let n = defined(samples).count();
            if n == 0 {
                f64::NAN
            } else {
                n as f64
            }
        }
        RangeFunction::AvgOverTime => {
            let (sum, n) = defined(samples).fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            if n == 0 {
                f64::NAN
            } else {
                sum / n as f64
            }
        }
        RangeFunction::MinOverTime => fold_defined(samples, f64::min, f64::INFINITY),
        RangeFunction::MaxOverTime => fold_defined(samples, f64::max, f64::NEG_INFINITY),
        RangeFunction::StddevOverTime => variance(samples).sqrt(),
        RangeFunction::StdvarOverTime => variance(samples),
        RangeFunction::QuantileOverTime(q) => {
            let mut values: Vec<f64> = defined(samples).collect();
            values.sort_by(|a, b| a.partial_cmp(b).expect("no NaN after filter"));
            quantile_sorted(*q, &values)
        }
    }
}

fn defined(samples: &[Sample]) -> impl Iterator<Item = f64> + '_ {
    samples.iter().map(|s| s.value).filter(|v| !v.is_nan())
}

fn fold_defined(samples: &[Sample], f: impl Fn(f64, f64) -> f64, init: f64) -> f64 {
    let mut any = false;
    let mut acc = init;
    for v in defined(samples) {
        acc = f(acc, v);
        any = true;
    }
    if any {
        acc
    } else {
        f64::NAN
    }
}

fn variance(samples: &[Sample]) -> f64 {
    let (sum, n) = defined(samples).fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        return f64::NAN;
    }
    let mean = sum / n as f64;
    defined(samples).map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64
}

/// Quantile over sorted, NaN-free values (Prometheus interpolation).
pub fn quantile_sorted(q: f64, sorted: &[f64]) -> f64 {
    if sorted.is_empty() || !(0.0..=1.0).contains(&q) {
        return f64::NAN;
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Counter-reset-corrected, boundary-extrapolated change over the window.
fn extrapolated(
    samples: &[Sample],
    window_start: i64,
    window_end: i64,
    counter: bool,
    per_second: bool,
) -> f64 {
    let samples: Vec<Sample> = samples.iter().filter(|s| !s.value.is_nan()).copied().collect();
    if samples.len() < 2 {
        return f64::NAN;
    }
    let first = samples[0];
    let last = samples[samples.len() - 1];

    let mut result = last.value - first.value;
    if counter {
        let mut prev = first.value;
        for s in &samples[1..] {
            if s.value < prev {
                result += prev;
            }
            prev = s.value;
        }
    }

    let sampled_interval = (last.ts - first.ts) as f64;
    let avg_duration = sampled_interval / (samples.len() - 1) as f64;
    let mut duration_to_start = (first.ts - window_start) as f64;
    let duration_to_end = (window_end - last.ts) as f64;
    let threshold = avg_duration * 1.1;

    // A counter cannot have been below zero; never extrapolate past the
    // point where it would have been.
    if counter && result > 0.0 && first.value >= 0.0 {
        let duration_to_zero = sampled_interval * (first.value / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    let mut extrapolate_to = sampled_interval;
    extrapolate_to += if duration_to_start < threshold {
        duration_to_start
    } else {
        avg_duration / 2.0
    };
    extrapolate_to += if duration_to_end < threshold {
        duration_to_end
    } else {
        avg_duration / 2.0
    };

    let mut value = result * (extrapolate_to / sampled_interval);
    if per_second {
        value /= (window_end - window_start) as f64 / 1000.0;
    }
    value
}

fn irate(samples: &[Sample]) -> f64 {
    let defined: Vec<Sample> = samples.iter().filter(|s| !s.value.is_nan()).copied().collect();
    if defined.len() < 2 {
        return f64::NAN;
    }
    let prev = defined[defined.len() - 2];
    let last = defined[defined.len() - 1];
    let diff = if last.value < prev.value {
        last.value // reset: counter restarted from zero
    } else {
        last.value - prev.value
    };
    diff / ((last.ts - prev.ts) as f64 / 1000.0)
}

/// Streaming accumulator for the chunked `*_over_time` variants. Chunk row
/// ranges feed it through the reader's `sum`/`count` primitives; buffered
/// (unsealed) rows feed it one value at a time.
#[derive(Debug)]
pub enum ChunkedAccumulator {
    Sum { sum: f64, any: bool },
    Count { n: usize },
    Avg { sum: f64, n: usize },
    Min { min: f64, any: bool },
    Max { max: f64, any: bool },
}

impl ChunkedAccumulator {
    /// Accumulator for a chunked-capable function; `None` otherwise.
    pub fn for_function(function: &RangeFunction) -> Option<Self> {
        Some(match function {
            RangeFunction::SumOverTime => ChunkedAccumulator::Sum { sum: 0.0, any: false },
            RangeFunction::CountOverTime => ChunkedAccumulator::Count { n: 0 },
            RangeFunction::AvgOverTime => ChunkedAccumulator::Avg { sum: 0.0, n: 0 },
            RangeFunction::MinOverTime => ChunkedAccumulator::Min {
                min: f64::INFINITY,
                any: false,
            },
            RangeFunction::MaxOverTime => ChunkedAccumulator::Max {
                max: f64::NEG_INFINITY,
                any: false,
            },
            _ => return None,
        })
    }

    /// Fold in rows `[start_row, end_row]` of one chunk.
    pub fn add_chunk_range(&mut self, reader: &DoubleReader, start_row: usize, end_row: usize) {
        match self {
            ChunkedAccumulator::Sum { sum, any } => {
                if reader.count(start_row, end_row) > 0 {
                    *sum += reader.sum(start_row, end_row);
                    *any = true;
                }
            }
            ChunkedAccumulator::Count { n } => *n += reader.count(start_row, end_row),
            ChunkedAccumulator::Avg { sum, n } => {
                *sum += reader.sum(start_row, end_row);
                *n += reader.count(start_row, end_row);
            }
            ChunkedAccumulator::Min { .. } | ChunkedAccumulator::Max { .. } => {
                for row in start_row..=end_row {
                    self.add_value(reader.apply(row));
                }
            }
        }
    }

    /// Fold in one unsealed buffer value.
    pub fn add_value(&mut self, v: f64) {
        if v.is_nan() {
            return;
        }
        match self {
            ChunkedAccumulator::Sum { sum, any } => {
                *sum += v;
                *any = true;
            }
            ChunkedAccumulator::Count { n } => *n += 1,
            ChunkedAccumulator::Avg { sum, n } => {
                *sum += v;
                *n += 1;
            }
            ChunkedAccumulator::Min { min, any } => {
                *min = min.min(v);
                *any = true;
            }
            ChunkedAccumulator::Max { max, any } => {
                *max = max.max(v);
                *any = true;
            }
        }
    }

    /// The window's value, NaN when nothing accumulated.
    pub fn result(&self) -> f64 {
        match self {
            ChunkedAccumulator::Sum { sum, any } => {
                if *any {
                    *sum
                } else {
                    f64::NAN
                }
            }
            ChunkedAccumulator::Count { n } => {
                if *n == 0 {
                    f64::NAN
                } else {
                    *n as f64
                }
            }
            ChunkedAccumulator::Avg { sum, n } => {
                if *n == 0 {
                    f64::NAN
                } else {
                    *sum / *n as f64
                }
            }
            ChunkedAccumulator::Min { min, any } => {
                if *any {
                    *min
                } else {
                    f64::NAN
                }
            }
            ChunkedAccumulator::Max { max, any } => {
                if *any {
                    *max
                } else {
                    f64::NAN
                }
            }
        }
    }
}
