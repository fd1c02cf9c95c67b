//! Vector-vector joins and set operators

use super::logical::{BinaryOp, Cardinality};
use super::rangevector::{RangeVector, RangeVectorKey, Sample};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};

const METRIC_NAME_LABEL: &str = "__name__";

/// The labels a series joins on: `on` when given, otherwise everything except
/// `ignoring` and the metric name.
pub fn join_keys(key: &RangeVectorKey, on: &[String], ignoring: &[String]) -> RangeVectorKey {
    if !on.is_empty() {
        return key
            .iter()
            .filter(|(name, _)| on.contains(name))
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
    }
    key.iter()
        .filter(|(name, _)| name.as_str() != METRIC_NAME_LABEL && !ignoring.contains(name))
        .map(|(n, v)| (n.clone(), v.clone()))
        .collect()
}

/// Arithmetic join of two sides under the cardinality rules. NaN on either
/// side of an operator yields NaN in the result row.
pub fn binary_join(
    lhs: Vec<RangeVector>,
    rhs: Vec<RangeVector>,
    op: BinaryOp,
    cardinality: Cardinality,
    on: &[String],
    ignoring: &[String],
    include: &[String],
) -> Result<Vec<RangeVector>> {
    if op.is_set_op() {
        return Err(Error::BadQuery(format!(
            "{op:?} is a set operator, not an arithmetic join"
        )));
    }
    match cardinality {
        Cardinality::OneToOne => one_to_one(lhs, rhs, op, on, ignoring),
        Cardinality::ManyToOne => many_to_one(lhs, rhs, op, on, ignoring, include, false),
        Cardinality::OneToMany => many_to_one(rhs, lhs, op, on, ignoring, include, true),
        Cardinality::ManyToMany => Err(Error::BadQuery(
            "many-to-many is only valid for set operators".into(),
        )),
    }
}

fn one_to_one(
    lhs: Vec<RangeVector>,
    rhs: Vec<RangeVector>,
    op: BinaryOp,
    on: &[String],
    ignoring: &[String],
) -> Result<Vec<RangeVector>> {
    let rhs_by_key = unique_side(rhs, on, ignoring, "right")?;
    let mut seen_lhs: HashMap<RangeVectorKey, ()> = HashMap::new();
    let mut result = Vec::new();
    for lv in lhs {
        let jk = join_keys(&lv.key, on, ignoring);
        if seen_lhs.insert(jk.clone(), ()).is_some() {
            return Err(Error::BadQuery(format!(
                "duplicate series on left side of one-to-one join for key {jk:?}"
            )));
        }
        let Some(rv) = rhs_by_key.get(&jk) else {
            continue;
        };
        // 1:1 result carries exactly the matched labels
        let samples = combine(lv.double_samples()?, rv.double_samples()?, |l, r| {
            op.apply(l, r)
        });
        result.push(RangeVector::doubles(jk, samples));
    }
    Ok(result)
}

/// `many` may repeat join keys; `one` may not. `include` labels are copied
/// from the one side onto each result.
fn many_to_one(
    many: Vec<RangeVector>,
    one: Vec<RangeVector>,
    op: BinaryOp,
    on: &[String],
    ignoring: &[String],
    include: &[String],
    one_is_lhs: bool,
) -> Result<Vec<RangeVector>> {
    let one_by_key = unique_side(one, on, ignoring, "one")?;
    let mut result = Vec::new();
    for mv in many {
        let jk = join_keys(&mv.key, on, ignoring);
        let Some(ov) = one_by_key.get(&jk) else {
            continue;
        };
        let mut key: RangeVectorKey = mv
            .key
            .iter()
            .filter(|(name, _)| name.as_str() != METRIC_NAME_LABEL)
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        for name in include {
            if let Some(v) = ov.key.get(name) {
                key.insert(name.clone(), v.clone());
            }
        }
        let samples = if one_is_lhs {
            combine(ov.double_samples()?, mv.double_samples()?, |l, r| {
                op.apply(l, r)
            })
        } else {
            combine(mv.double_samples()?, ov.double_samples()?, |l, r| {
                op.apply(l, r)
            })
        };
        result.push(RangeVector::doubles(key, samples));
    }
    Ok(result)
}

fn unique_side(
    vectors: Vec<RangeVector>,
    on: &[String],
    ignoring: &[String],
    side: &str,
) -> Result<HashMap<RangeVectorKey, RangeVector>> {
    let mut by_key = HashMap::new();
    for v in vectors {
        let jk = join_keys(&v.key, on, ignoring);
        if by_key.insert(jk.clone(), v).is_some() {
            return Err(Error::BadQuery(format!(
                "duplicate series on {side} side of join for key {jk:?}"
            )));
        }
    }
    Ok(by_key)
}

/// Pointwise combine at timestamps present on both sides.
fn combine(lhs: &[Sample], rhs: &[Sample], f: impl Fn(f64, f64) -> f64) -> Vec<Sample> {
    let rhs_by_ts: BTreeMap<i64, f64> = rhs.iter().map(|s| (s.ts, s.value)).collect();
    lhs.iter()
        .filter_map(|l| {
            rhs_by_ts
                .get(&l.ts)
                .map(|r| Sample::new(l.ts, f(l.value, *r)))
        })
        .collect()
}

/// Set operators: AND, OR, UNLESS.
pub fn set_operation(
    lhs: Vec<RangeVector>,
    rhs: Vec<RangeVector>,
    op: BinaryOp,
    on: &[String],
    ignoring: &[String],
) -> Result<Vec<RangeVector>> {
    match op {
        BinaryOp::And => set_and(lhs, rhs, on, ignoring),
        BinaryOp::Or => Ok(set_or(lhs, rhs, on, ignoring)),
        BinaryOp::Unless => Ok(set_unless(lhs, rhs, on, ignoring)),
        other => Err(Error::BadQuery(format!("{other:?} is not a set operator"))),
    }
}

/// Keep lhs series whose join key appears on the rhs; mask rows to NaN where
/// the rhs has no value (or NaN) at that timestamp.
fn set_and(
    lhs: Vec<RangeVector>,
    rhs: Vec<RangeVector>,
    on: &[String],
    ignoring: &[String],
) -> Result<Vec<RangeVector>> {
    // Merge rhs rows per join key so duplicate rhs series still mask correctly
    let mut rhs_rows: HashMap<RangeVectorKey, BTreeMap<i64, f64>> = HashMap::new();
    for v in &rhs {
        let jk = join_keys(&v.key, on, ignoring);
        let rows = rhs_rows.entry(jk).or_default();
        for s in v.double_samples()? {
            rows.entry(s.ts)
                .and_modify(|existing| {
                    if existing.is_nan() {
                        *existing = s.value;
                    }
                })
                .or_insert(s.value);
        }
    }
    let mut result = Vec::new();
    for lv in lhs {
        let jk = join_keys(&lv.key, on, ignoring);
        let Some(rows) = rhs_rows.get(&jk) else {
            continue;
        };
        let samples = lv
            .double_samples()?
            .iter()
            .map(|s| {
                let present = rows.get(&s.ts).map(|v| !v.is_nan()).unwrap_or(false);
                Sample::new(s.ts, if present { s.value } else { f64::NAN })
            })
            .collect();
        result.push(RangeVector::doubles(lv.key, samples));
    }
    Ok(result)
}

/// lhs plus rhs series whose join key is absent from lhs.
fn set_or(
    lhs: Vec<RangeVector>,
    rhs: Vec<RangeVector>,
    on: &[String],
    ignoring: &[String],
) -> Vec<RangeVector> {
    let lhs_keys: HashMap<RangeVectorKey, ()> = lhs
        .iter()
        .map(|v| (join_keys(&v.key, on, ignoring), ()))
        .collect();
    let mut result = lhs;
    for v in rhs {
        if !lhs_keys.contains_key(&join_keys(&v.key, on, ignoring)) {
            result.push(v);
        }
    }
    result
}

/// lhs series whose join key is absent from rhs.
fn set_unless(
    lhs: Vec<RangeVector>,
    rhs: Vec<RangeVector>,
    on: &[String],
    ignoring: &[String],
) -> Vec<RangeVector> {
    let rhs_keys: HashMap<RangeVectorKey, ()> = rhs
        .iter()
        .map(|v| (join_keys(&v.key, on, ignoring), ()))
        .collect();
    lhs.into_iter()
        .filter(|v| !rhs_keys.contains_key(&join_keys(&v.key, on, ignoring)))
        .collect()
}
