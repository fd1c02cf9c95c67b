//! Range-vector transformers
//!
//! Transformers attach to exec-plan nodes and rewrite the node's output
//! stream. Most apply per vector and stream straight through; the only
//! buffering transformers are sort, absent, histogram_quantile, and the
//! grouped aggregation partial.

use super::aggregate;
use super::logical::{AggregateOp, InstantFunction, MiscFunction, RangeFunction};
use super::rangefns::{self, ChunkedAccumulator};
use super::rangevector::{
    HistSample, RangeVector, RangeVectorKey, RangeVectorStream, ResultSchema, Sample,
};
use crate::memstore::{ColumnFilter, FilterOp, PartitionSnapshot};
use crate::schema::ColumnType;
use crate::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;

/// Default lookback for instant-vector selection, Prometheus-style
pub const DEFAULT_LOOKBACK_MS: i64 = 300_000;

const METRIC_NAME_LABEL: &str = "__name__";
const BUCKET_LABEL: &str = "le";

/// Samples a raw series at step boundaries, applying the configured range
/// function over the lookback window `(t - window, t]` at each step `t`.
#[derive(Debug, Clone)]
pub struct PeriodicSamplesMapper {
    pub start: i64,
    pub step: i64,
    pub end: i64,
    /// Window length; defaults to the standard lookback when absent
    pub window: Option<i64>,
    /// Range function; `None` selects the last sample in the window
    pub function: Option<RangeFunction>,
}

impl PeriodicSamplesMapper {
    pub fn new(start: i64, step: i64, end: i64, window: Option<i64>, function: Option<RangeFunction>) -> Self {
        Self {
            start,
            step,
            end,
            window,
            function,
        }
    }

    fn window_ms(&self) -> i64 {
        self.window.unwrap_or(DEFAULT_LOOKBACK_MS)
    }

    fn steps(&self) -> impl Iterator<Item = i64> {
        let (start, step, end) = (self.start, self.step.max(1), self.end);
        (0..).map(move |i| start + i * step).take_while(move |t| *t <= end)
    }

    /// True when the leaf scan can answer this mapper straight from chunk
    /// readers without materializing raw rows.
    pub fn chunked_eligible(&self) -> bool {
        self.function
            .as_ref()
            .map(|f| f.is_chunked_capable())
            .unwrap_or(false)
    }

    /// Sliding evaluation over a materialized raw vector.
    pub fn map_vector(&self, rv: RangeVector) -> Result<RangeVector> {
        let window = self.window_ms();
        match rv.data {
            super::rangevector::SeriesData::Doubles(raw) => {
                let function = self.function.clone().unwrap_or(RangeFunction::Last);
                let samples = self
                    .steps()
                    .map(|t| {
                        let lo = raw.partition_point(|s| s.ts <= t - window);
                        let hi = raw.partition_point(|s| s.ts <= t);
                        Sample::new(t, rangefns::evaluate(&function, &raw[lo..hi], t - window, t))
                    })
                    .collect();
                Ok(RangeVector::doubles(rv.key, samples))
            }
            super::rangevector::SeriesData::Histograms(raw) => {
                // Histogram series support instant selection only
                let samples = self
                    .steps()
                    .filter_map(|t| {
                        raw.iter()
                            .rev()
                            .find(|s| s.ts <= t && s.ts > t - window)
                            .map(|s| HistSample {
                                ts: t,
                                value: s.value.clone(),
                            })
                    })
                    .collect();
                Ok(RangeVector::histograms(rv.key, samples))
            }
        }
    }

    /// Chunked evaluation straight off a partition snapshot, preferred for
    /// associative window functions.
    pub fn map_snapshot_chunked(
        &self,
        snapshot: &PartitionSnapshot,
        column_id: u16,
        key: RangeVectorKey,
    ) -> Result<RangeVector> {
        let window = self.window_ms();
        let function = self
            .function
            .clone()
            .unwrap_or(RangeFunction::SumOverTime);
        let readers: Vec<_> = snapshot.chunk_readers();
        let mut decoded = Vec::with_capacity(readers.len());
        for reader in &readers {
            decoded.push((reader.timestamps()?, reader.doubles(column_id)?));
        }

        let mut samples = Vec::new();
        for t in self.steps() {
            let mut acc = ChunkedAccumulator::for_function(&function)
                .ok_or_else(|| crate::Error::Internal("function not chunked-capable".into()))?;
            for (timestamps, doubles) in &decoded {
                // rows with window_start < ts <= t
                let lo = match timestamps.ceiling_index(t - window) {
                    Some(row) => row + 1,
                    None => 0,
                };
                let Some(hi) = timestamps.ceiling_index(t) else {
                    continue;
                };
                if lo > hi {
                    continue;
                }
                acc.add_chunk_range(doubles, lo, hi);
            }
            if let Some(buffer) = &snapshot.buffer {
                if let Some(col_ix) = snapshot
                    .schema
                    .data_columns()
                    .iter()
                    .position(|c| c.id == column_id)
                {
                    if let crate::memstore::ColumnData::Double(values) = &buffer.columns[col_ix] {
                        for (ts, v) in buffer.timestamps.iter().zip(values) {
                            if *ts > t - window && *ts <= t {
                                acc.add_value(*v);
                            }
                        }
                    }
                }
            }
            samples.push(Sample::new(t, acc.result()));
        }
        Ok(RangeVector::doubles(key, samples))
    }
}

/// Transformers attachable to an exec-plan node, applied in order
#[derive(Debug, Clone)]
pub enum RangeVectorTransformer {
    PeriodicSamples(PeriodicSamplesMapper),
    InstantFunction(InstantFunction),
    Miscellaneous(MiscFunction),
    Sort { descending: bool },
    Absent {
        filters: Vec<ColumnFilter>,
        start: i64,
        step: i64,
        end: i64,
    },
    AggregatePartial {
        op: AggregateOp,
        by: Vec<String>,
        without: Vec<String>,
    },
}

impl RangeVectorTransformer {
    /// Rewrite a stream and its schema.
    pub fn transform(
        &self,
        schema: ResultSchema,
        input: RangeVectorStream,
    ) -> (ResultSchema, RangeVectorStream) {
        match self {
            RangeVectorTransformer::PeriodicSamples(mapper) => {
                let mapper = mapper.clone();
                (schema, map_stream(input, move |rv| mapper.map_vector(rv)))
            }
            RangeVectorTransformer::InstantFunction(InstantFunction::HistogramQuantile(q)) => {
                let q = *q;
                let schema = ResultSchema::time_series("value");
                (
                    schema,
                    buffered_stream(input, move |vectors| Ok(histogram_quantile(q, vectors))),
                )
            }
            RangeVectorTransformer::InstantFunction(function) => {
                let function = function.clone();
                (
                    schema,
                    map_stream(input, move |rv| apply_instant(&function, rv)),
                )
            }
            RangeVectorTransformer::Miscellaneous(MiscFunction::HistToPromVectors) => {
                let schema = ResultSchema {
                    columns: vec![
                        super::rangevector::ColumnInfo::new("timestamp", ColumnType::Timestamp),
                        super::rangevector::ColumnInfo::new("value", ColumnType::Double),
                    ],
                    is_time_series: true,
                    is_histogram_double: true,
                };
                (schema, flat_map_stream(input, hist_to_prom_vectors))
            }
            RangeVectorTransformer::Sort { descending } => {
                let descending = *descending;
                (
                    schema,
                    buffered_stream(input, move |mut vectors| {
                        vectors.sort_by(|a, b| {
                            let (ma, mb) = (mean_value(a), mean_value(b));
                            let ord = ma.partial_cmp(&mb).unwrap_or(std::cmp::Ordering::Equal);
                            if descending {
                                ord.reverse()
                            } else {
                                ord
                            }
                        });
                        Ok(vectors)
                    }),
                )
            }
            RangeVectorTransformer::Absent {
                filters,
                start,
                step,
                end,
            } => {
                let (filters, start, step, end) = (filters.clone(), *start, *step, *end);
                (
                    ResultSchema::time_series("value"),
                    buffered_stream(input, move |vectors| {
                        if !vectors.is_empty() {
                            return Ok(vec![]);
                        }
                        let key: RangeVectorKey = filters
                            .iter()
                            .filter(|f| f.column != METRIC_NAME_LABEL)
                            .filter_map(|f| match &f.op {
                                FilterOp::Equals(v) => Some((f.column.clone(), v.clone())),
                                _ => None,
                            })
                            .collect();
                        let step = step.max(1);
                        let samples = (0..)
                            .map(|i| start + i * step)
                            .take_while(|t| *t <= end)
                            .map(|t| Sample::new(t, 1.0))
                            .collect();
                        Ok(vec![RangeVector::doubles(key, samples)])
                    }),
                )
            }
            RangeVectorTransformer::AggregatePartial { op, by, without } => {
                let (op, by, without) = (op.clone(), by.clone(), without.clone());
                (
                    schema,
                    buffered_stream(input, move |vectors| {
                        aggregate::aggregate(&op, vectors, &by, &without)
                    }),
                )
            }
        }
    }
}

/// Per-vector stream map
pub fn map_stream(
    input: RangeVectorStream,
    f: impl Fn(RangeVector) -> Result<RangeVector> + Send + Sync + 'static,
) -> RangeVectorStream {
    input.map(move |rv| rv.and_then(&f)).boxed()
}

/// One-vector-to-many stream map
pub fn flat_map_stream(
    input: RangeVectorStream,
    f: impl Fn(RangeVector) -> Result<Vec<RangeVector>> + Send + Sync + 'static,
) -> RangeVectorStream {
    input
        .map(move |rv| rv.and_then(&f))
        .map(|result| match result {
            Ok(vectors) => stream::iter(vectors.into_iter().map(Ok)).left_stream(),
            Err(e) => stream::once(futures::future::ready(Err(e))).right_stream(),
        })
        .flatten()
        .boxed()
}

/// Collect-then-emit for transformers that need global vision
pub fn buffered_stream(
    input: RangeVectorStream,
    f: impl FnOnce(Vec<RangeVector>) -> Result<Vec<RangeVector>> + Send + 'static,
) -> RangeVectorStream {
    stream::once(async move {
        let vectors: Result<Vec<RangeVector>> = input.try_collect().await;
        vectors.and_then(f).map(|vs| stream::iter(vs.into_iter().map(Ok)))
    })
    .try_flatten()
    .boxed()
}

fn mean_value(rv: &RangeVector) -> f64 {
    match rv.double_samples() {
        Ok(samples) => {
            let (sum, n) = samples
                .iter()
                .map(|s| s.value)
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            if n == 0 {
                f64::NAN
            } else {
                sum / n as f64
            }
        }
        Err(_) => f64::NAN,
    }
}

fn apply_instant(function: &InstantFunction, rv: RangeVector) -> Result<RangeVector> {
    let f = |v: f64| -> f64 {
        match function {
            InstantFunction::Abs => v.abs(),
            InstantFunction::Ceil => v.ceil(),
            InstantFunction::Exp => v.exp(),
            InstantFunction::Floor => v.floor(),
            InstantFunction::Ln => v.ln(),
            InstantFunction::Log10 => v.log10(),
            InstantFunction::Log2 => v.log2(),
            InstantFunction::Round => v.round(),
            InstantFunction::Sqrt => v.sqrt(),
            InstantFunction::ClampMin(min) => v.max(*min),
            InstantFunction::ClampMax(max) => v.min(*max),
            InstantFunction::HistogramQuantile(_) => unreachable!("buffered path"),
        }
    };
    let samples = rv
        .double_samples()?
        .iter()
        .map(|s| Sample::new(s.ts, if s.value.is_nan() { f64::NAN } else { f(s.value) }))
        .collect();
    Ok(RangeVector::doubles(rv.key, samples))
}

/// Group prom-schema bucket series by their non-`le` labels and interpolate
/// the requested quantile per timestamp.
pub fn histogram_quantile(q: f64, vectors: Vec<RangeVector>) -> Vec<RangeVector> {
    // group key -> ts -> (le, cumulative count)
    let mut groups: BTreeMap<RangeVectorKey, BTreeMap<i64, Vec<(f64, f64)>>> = BTreeMap::new();
    for rv in &vectors {
        let Some(le_str) = rv.key.get(BUCKET_LABEL) else {
            continue;
        };
        let le = parse_le(le_str);
        if le.is_nan() {
            continue;
        }
        let group: RangeVectorKey = rv
            .key
            .iter()
            .filter(|(name, _)| name.as_str() != BUCKET_LABEL && name.as_str() != METRIC_NAME_LABEL)
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        let Ok(samples) = rv.double_samples() else {
            continue;
        };
        let buckets = groups.entry(group).or_default();
        for s in samples {
            if s.value.is_nan() {
                continue; // bucket absent at this instant
            }
            buckets.entry(s.ts).or_default().push((le, s.value));
        }
    }

    groups
        .into_iter()
        .map(|(key, by_ts)| {
            let samples = by_ts
                .into_iter()
                .map(|(ts, mut buckets)| {
                    buckets.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("le never NaN"));
                    Sample::new(ts, bucket_quantile(q, &buckets))
                })
                .collect();
            RangeVector::doubles(key, samples)
        })
        .collect()
}

/// Prometheus bucket interpolation over cumulative counts.
fn bucket_quantile(q: f64, buckets: &[(f64, f64)]) -> f64 {
    if !(0.0..=1.0).contains(&q) || buckets.len() < 2 {
        return f64::NAN;
    }
    let (last_le, total) = buckets[buckets.len() - 1];
    if !last_le.is_infinite() || total <= 0.0 {
        return f64::NAN;
    }
    let rank = q * total;
    let b = buckets.partition_point(|(_, count)| *count < rank);
    if b >= buckets.len() - 1 {
        // answer lies in the +Inf bucket: report the highest finite bound
        return buckets[buckets.len() - 2].0;
    }
    let (le, count) = buckets[b];
    let (prev_le, prev_count) = if b == 0 { (0.0, 0.0) } else { buckets[b - 1] };
    let in_bucket = count - prev_count;
    if in_bucket <= 0.0 {
        return le;
    }
    prev_le + (le - prev_le) * ((rank - prev_count) / in_bucket)
}

fn parse_le(s: &str) -> f64 {
    match s {
        "+Inf" => f64::INFINITY,
        other => other.parse().unwrap_or(f64::NAN),
    }
}

fn format_le(le: f64) -> String {
    if le.is_infinite() {
        "+Inf".to_string()
    } else if le == le.trunc() && le.abs() < 1e15 {
        format!("{}", le as i64)
    } else {
        format!("{le}")
    }
}

/// Expand one histogram vector into per-bucket prom series. Bucket schemes
/// may change mid-stream: rows missing a bucket pad with NaN, and buckets
/// seen in later rows backfill NaN for earlier ones.
pub fn hist_to_prom_vectors(rv: RangeVector) -> Result<Vec<RangeVector>> {
    let hist_samples = match &rv.data {
        super::rangevector::SeriesData::Histograms(v) => v,
        super::rangevector::SeriesData::Doubles(_) => {
            return Err(crate::Error::SchemaMismatch(
                "hist_to_prom_vectors requires histogram rows".into(),
            ))
        }
    };

    // Union of bucket bounds across every row's scheme
    let mut bounds: Vec<f64> = Vec::new();
    for s in hist_samples {
        for &b in s.value.bounds.iter() {
            if !bounds.iter().any(|x| x == &b) {
                bounds.push(b);
            }
        }
    }
    bounds.sort_by(|a, b| a.partial_cmp(b).expect("bounds never NaN"));

    let base_name = rv
        .key
        .get(METRIC_NAME_LABEL)
        .cloned()
        .unwrap_or_default();
    Ok(bounds
        .into_iter()
        .map(|bound| {
            let mut key = rv.key.clone();
            if !base_name.is_empty() {
                key.insert(METRIC_NAME_LABEL.into(), format!("{base_name}_bucket"));
            }
            key.insert(BUCKET_LABEL.into(), format_le(bound));
            let samples = hist_samples
                .iter()
                .map(|s| {
                    let value = s
                        .value
                        .bounds
                        .iter()
                        .position(|b| *b == bound)
                        .map(|ix| s.value.counts[ix])
                        .unwrap_or(f64::NAN);
                    Sample::new(s.ts, value)
                })
                .collect();
            RangeVector::doubles(key, samples)
        })
        .collect())
}
