//! Streaming aggregation over range vectors
//!
//! Aggregation is keyed by the `by`/`without` projection of each vector's
//! labels and runs per timestamp across the grouped series. Associative
//! operators additionally run as per-shard partials that the cross-shard
//! reducer merges with the same operator.

use super::logical::AggregateOp;
use super::rangefns::quantile_sorted;
use super::rangevector::{RangeVector, RangeVectorKey, Sample};
use crate::Result;
use std::collections::BTreeMap;

const METRIC_NAME_LABEL: &str = "__name__";

/// Project a vector key through `by`/`without`. Aggregation always drops the
/// metric name unless `by` asks for it.
pub fn project_key(key: &RangeVectorKey, by: &[String], without: &[String]) -> RangeVectorKey {
    if !by.is_empty() {
        return key
            .iter()
            .filter(|(name, _)| by.contains(name))
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
    }
    key.iter()
        .filter(|(name, _)| name.as_str() != METRIC_NAME_LABEL && !without.contains(name))
        .map(|(n, v)| (n.clone(), v.clone()))
        .collect()
}

/// Aggregate grouped vectors. Input vectors sharing a projected key collapse
/// into one output vector; NaN inputs count as missing.
pub fn aggregate(
    op: &AggregateOp,
    vectors: Vec<RangeVector>,
    by: &[String],
    without: &[String],
) -> Result<Vec<RangeVector>> {
    match op {
        AggregateOp::TopK(k) => return top_bottom_k(vectors, by, without, *k, true),
        AggregateOp::BottomK(k) => return top_bottom_k(vectors, by, without, *k, false),
        AggregateOp::CountValues(label) => return count_values(vectors, by, without, label),
        _ => {}
    }

    // group key -> ts -> accumulated state
    let mut groups: BTreeMap<RangeVectorKey, BTreeMap<i64, AggState>> = BTreeMap::new();
    for vector in &vectors {
        let group = project_key(&vector.key, by, without);
        let states = groups.entry(group).or_default();
        for sample in vector.double_samples()? {
            if sample.value.is_nan() {
                continue;
            }
            states
                .entry(sample.ts)
                .or_insert_with(|| AggState::new(op))
                .accumulate(sample.value);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, states)| {
            let samples = states
                .into_iter()
                .map(|(ts, state)| Sample::new(ts, state.result(op)))
                .collect();
            RangeVector::doubles(key, samples)
        })
        .collect())
}

/// Per-(group, timestamp) accumulator
#[derive(Debug, Clone)]
enum AggState {
    Sum(f64),
    /// Running sum + count pair, also backing stddev/stdvar via Welford
    Moments { count: f64, mean: f64, m2: f64 },
    Min(f64),
    Max(f64),
    Count(f64),
    Values(Vec<f64>),
    Group,
}

impl AggState {
    fn new(op: &AggregateOp) -> Self {
        match op {
            AggregateOp::Sum => AggState::Sum(0.0),
            AggregateOp::Avg | AggregateOp::Stddev | AggregateOp::Stdvar => AggState::Moments {
                count: 0.0,
                mean: 0.0,
                m2: 0.0,
            },
            AggregateOp::Min => AggState::Min(f64::INFINITY),
            AggregateOp::Max => AggState::Max(f64::NEG_INFINITY),
            AggregateOp::Count => AggState::Count(0.0),
            AggregateOp::Quantile(_) => AggState::Values(Vec::new()),
            AggregateOp::Group => AggState::Group,
            AggregateOp::TopK(_) | AggregateOp::BottomK(_) | AggregateOp::CountValues(_) => {
                unreachable!("handled before grouping")
            }
        }
    }

    fn accumulate(&mut self, v: f64) {
        match self {
            AggState::Sum(s) => *s += v,
            AggState::Moments { count, mean, m2 } => {
                *count += 1.0;
                let delta = v - *mean;
                *mean += delta / *count;
                *m2 += delta * (v - *mean);
            }
            AggState::Min(m) => *m = m.min(v),
            AggState::Max(m) => *m = m.max(v),
            AggState::Count(c) => *c += 1.0,
            AggState::Values(values) => values.push(v),
            AggState::Group => {}
        }
    }

    fn result(&self, op: &AggregateOp) -> f64 {
        match (self, op) {
            (AggState::Sum(s), _) => *s,
            (AggState::Moments { mean, .. }, AggregateOp::Avg) => *mean,
            (AggState::Moments { count, m2, .. }, AggregateOp::Stdvar) => *m2 / *count,
            (AggState::Moments { count, m2, .. }, AggregateOp::Stddev) => (*m2 / *count).sqrt(),
            (AggState::Min(m), _) => *m,
            (AggState::Max(m), _) => *m,
            (AggState::Count(c), _) => *c,
            (AggState::Values(values), AggregateOp::Quantile(q)) => {
                let mut sorted = values.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).expect("NaN filtered at accumulate"));
                quantile_sorted(*q, &sorted)
            }
            (AggState::Group, _) => 1.0,
            _ => f64::NAN,
        }
    }
}

/// topk/bottomk keep the winning original series per timestamp.
fn top_bottom_k(
    vectors: Vec<RangeVector>,
    by: &[String],
    without: &[String],
    k: usize,
    top: bool,
) -> Result<Vec<RangeVector>> {
    // (group, ts) -> bounded candidate list of (value, series index)
    let mut rankings: BTreeMap<(RangeVectorKey, i64), Vec<(f64, usize)>> = BTreeMap::new();
    for (ix, vector) in vectors.iter().enumerate() {
        let group = project_key(&vector.key, by, without);
        for sample in vector.double_samples()? {
            if sample.value.is_nan() {
                continue;
            }
            let heap = rankings.entry((group.clone(), sample.ts)).or_default();
            heap.push((sample.value, ix));
            // bounded priority queue: keep only the k best
            heap.sort_by(|a, b| {
                if top {
                    b.0.partial_cmp(&a.0).expect("NaN filtered")
                } else {
                    a.0.partial_cmp(&b.0).expect("NaN filtered")
                }
            });
            heap.truncate(k);
        }
    }

    // series index -> winning samples
    let mut winners: BTreeMap<usize, Vec<Sample>> = BTreeMap::new();
    for ((_, ts), candidates) in rankings {
        for (value, ix) in candidates {
            winners.entry(ix).or_default().push(Sample::new(ts, value));
        }
    }
    Ok(winners
        .into_iter()
        .map(|(ix, mut samples)| {
            samples.sort_by_key(|s| s.ts);
            RangeVector::doubles(vectors[ix].key.clone(), samples)
        })
        .collect())
}

/// count_values: one output series per distinct value, tagged with `label`.
fn count_values(
    vectors: Vec<RangeVector>,
    by: &[String],
    without: &[String],
    label: &str,
) -> Result<Vec<RangeVector>> {
    let mut groups: BTreeMap<RangeVectorKey, BTreeMap<i64, f64>> = BTreeMap::new();
    for vector in &vectors {
        let base = project_key(&vector.key, by, without);
        for sample in vector.double_samples()? {
            if sample.value.is_nan() {
                continue;
            }
            let mut key = base.clone();
            key.insert(label.to_string(), format_value(sample.value));
            *groups.entry(key).or_default().entry(sample.ts).or_insert(0.0) += 1.0;
        }
    }
    Ok(groups
        .into_iter()
        .map(|(key, counts)| {
            let samples = counts.into_iter().map(|(ts, c)| Sample::new(ts, c)).collect();
            RangeVector::doubles(key, samples)
        })
        .collect())
}

fn format_value(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pairs: &[(&str, &str)]) -> RangeVectorKey {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn vector(pairs: &[(&str, &str)], values: &[(i64, f64)]) -> RangeVector {
        RangeVector::doubles(
            key(pairs),
            values.iter().map(|&(ts, v)| Sample::new(ts, v)).collect(),
        )
    }

    #[test]
    fn sum_groups_by_label() {
        let vectors = vec![
            vector(&[("__name__", "m"), ("app", "a"), ("inst", "1")], &[(10, 1.0), (20, 2.0)]),
            vector(&[("__name__", "m"), ("app", "a"), ("inst", "2")], &[(10, 3.0), (20, 4.0)]),
            vector(&[("__name__", "m"), ("app", "b"), ("inst", "3")], &[(10, 10.0)]),
        ];
        let result = aggregate(&AggregateOp::Sum, vectors, &["app".into()], &[]).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].key, key(&[("app", "a")]));
        assert_eq!(
            result[0].double_samples().unwrap(),
            &[Sample::new(10, 4.0), Sample::new(20, 6.0)]
        );
        assert_eq!(result[1].double_samples().unwrap(), &[Sample::new(10, 10.0)]);
    }

    #[test]
    fn without_drops_labels_and_metric_name() {
        let vectors = vec![
            vector(&[("__name__", "m"), ("app", "a"), ("inst", "1")], &[(10, 1.0)]),
            vector(&[("__name__", "m"), ("app", "a"), ("inst", "2")], &[(10, 2.0)]),
        ];
        let result = aggregate(&AggregateOp::Sum, vectors, &[], &["inst".into()]).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].key, key(&[("app", "a")]));
        assert_eq!(result[0].double_samples().unwrap()[0].value, 3.0);
    }

    #[test]
    fn avg_and_stddev() {
        let vectors = vec![
            vector(&[("i", "1")], &[(10, 2.0)]),
            vector(&[("i", "2")], &[(10, 4.0)]),
            vector(&[("i", "3")], &[(10, 6.0)]),
        ];
        let avg = aggregate(&AggregateOp::Avg, vectors.clone(), &[], &["i".into()]).unwrap();
        assert_eq!(avg[0].double_samples().unwrap()[0].value, 4.0);

        let stdvar = aggregate(&AggregateOp::Stdvar, vectors.clone(), &[], &["i".into()]).unwrap();
        let v = stdvar[0].double_samples().unwrap()[0].value;
        assert!((v - 8.0 / 3.0).abs() < 1e-9);

        let count = aggregate(&AggregateOp::Count, vectors, &[], &["i".into()]).unwrap();
        assert_eq!(count[0].double_samples().unwrap()[0].value, 3.0);
    }

    #[test]
    fn nan_counts_as_missing() {
        let vectors = vec![
            vector(&[("i", "1")], &[(10, f64::NAN)]),
            vector(&[("i", "2")], &[(10, 5.0)]),
        ];
        let result = aggregate(&AggregateOp::Count, vectors, &[], &["i".into()]).unwrap();
        assert_eq!(result[0].double_samples().unwrap()[0].value, 1.0);
    }

    #[test]
    fn partial_then_merge_equals_global_for_sum() {
        let shard_a = vec![
            vector(&[("app", "a"), ("i", "1")], &[(10, 1.0)]),
            vector(&[("app", "a"), ("i", "2")], &[(10, 2.0)]),
        ];
        let shard_b = vec![vector(&[("app", "a"), ("i", "3")], &[(10, 4.0)])];
        let global = {
            let mut all = shard_a.clone();
            all.extend(shard_b.clone());
            aggregate(&AggregateOp::Sum, all, &["app".into()], &[]).unwrap()
        };
        let partial_a = aggregate(&AggregateOp::Sum, shard_a, &["app".into()], &[]).unwrap();
        let partial_b = aggregate(&AggregateOp::Sum, shard_b, &["app".into()], &[]).unwrap();
        let mut partials = partial_a;
        partials.extend(partial_b);
        let merged = aggregate(&AggregateOp::Sum, partials, &["app".into()], &[]).unwrap();
        assert_eq!(merged, global);
    }

    #[test]
    fn topk_keeps_original_series_keys() {
        let vectors = vec![
            vector(&[("inst", "1")], &[(10, 1.0), (20, 9.0)]),
            vector(&[("inst", "2")], &[(10, 5.0), (20, 2.0)]),
            vector(&[("inst", "3")], &[(10, 3.0), (20, 1.0)]),
        ];
        let result = aggregate(&AggregateOp::TopK(1), vectors, &[], &[]).unwrap();
        // inst=2 wins at ts 10, inst=1 wins at ts 20
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].key, key(&[("inst", "1")]));
        assert_eq!(result[0].double_samples().unwrap(), &[Sample::new(20, 9.0)]);
        assert_eq!(result[1].key, key(&[("inst", "2")]));
        assert_eq!(result[1].double_samples().unwrap(), &[Sample::new(10, 5.0)]);
    }

    #[test]
    fn quantile_interpolates() {
        let vectors = vec![
            vector(&[("i", "1")], &[(10, 1.0)]),
            vector(&[("i", "2")], &[(10, 2.0)]),
            vector(&[("i", "3")], &[(10, 3.0)]),
            vector(&[("i", "4")], &[(10, 4.0)]),
        ];
        let result = aggregate(&AggregateOp::Quantile(0.5), vectors, &[], &["i".into()]).unwrap();
        assert!((result[0].double_samples().unwrap()[0].value - 2.5).abs() < 1e-9);
    }

    #[test]
    fn count_values_adds_label() {
        let vectors = vec![
            vector(&[("i", "1")], &[(10, 2.0)]),
            vector(&[("i", "2")], &[(10, 2.0)]),
            vector(&[("i", "3")], &[(10, 7.0)]),
        ];
        let result = aggregate(
            &AggregateOp::CountValues("value".into()),
            vectors,
            &[],
            &["i".into()],
        )
        .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].key, key(&[("value", "2")]));
        assert_eq!(result[0].double_samples().unwrap()[0].value, 2.0);
        assert_eq!(result[1].key, key(&[("value", "7")]));
        assert_eq!(result[1].double_samples().unwrap()[0].value, 1.0);
    }
}
