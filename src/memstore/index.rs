//! Inverted label index
//!
//! Maps `(label name, value)` pairs to roaring bitmaps of partition ids.
//! New partitions are staged and become searchable only at explicit commit
//! points; queries work off an immutable snapshot taken at query start, so
//! reads may trail commits slightly but never observe a half-applied batch.

use crate::schema::Labels;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use roaring::RoaringBitmap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A single label filter
#[derive(Debug, Clone)]
pub struct ColumnFilter {
    /// Label name
    pub column: String,
    /// Match operator
    pub op: FilterOp,
}

/// Filter operators over label values. A missing label behaves as the empty
/// string, Prometheus-style.
#[derive(Debug, Clone)]
pub enum FilterOp {
    Equals(String),
    NotEquals(String),
    RegexMatch(Regex),
    RegexNotMatch(Regex),
}

impl ColumnFilter {
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Equals(value.into()),
        }
    }

    pub fn not_equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::NotEquals(value.into()),
        }
    }

    pub fn regex_match(column: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self {
            column: column.into(),
            op: FilterOp::RegexMatch(compile_anchored(pattern)?),
        })
    }

    pub fn regex_not_match(column: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self {
            column: column.into(),
            op: FilterOp::RegexNotMatch(compile_anchored(pattern)?),
        })
    }

    /// Evaluate against a decoded label set.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.column).map(String::as_str).unwrap_or("");
        match &self.op {
            FilterOp::Equals(v) => value == v,
            FilterOp::NotEquals(v) => value != v,
            FilterOp::RegexMatch(re) => re.is_match(value),
            FilterOp::RegexNotMatch(re) => !re.is_match(value),
        }
    }
}

/// PromQL regex matchers are fully anchored.
fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::BadQuery(format!("bad regex {pattern:?}: {e}")))
}

/// Immutable index state shared by in-flight queries
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    /// (name, value) -> partition ids
    postings: HashMap<(Arc<str>, Arc<str>), RoaringBitmap>,
    /// All committed partition ids
    all: RoaringBitmap,
}

impl IndexSnapshot {
    /// Partition ids satisfying the conjunction of `filters`.
    pub fn ids_matching(&self, filters: &[ColumnFilter]) -> RoaringBitmap {
        let mut result = self.all.clone();
        for filter in filters {
            if result.is_empty() {
                break;
            }
            result &= self.ids_for_filter(filter);
        }
        result
    }

    /// Partition ids satisfying the disjunction of `filters`.
    pub fn ids_matching_any(&self, filters: &[ColumnFilter]) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        for filter in filters {
            result |= self.ids_for_filter(filter);
        }
        result
    }

    fn ids_for_filter(&self, filter: &ColumnFilter) -> RoaringBitmap {
        match &filter.op {
            FilterOp::Equals(v) => self.ids_equals(&filter.column, v),
            FilterOp::NotEquals(v) => &self.all - self.ids_equals(&filter.column, v),
            FilterOp::RegexMatch(re) => self.ids_regex(&filter.column, re),
            FilterOp::RegexNotMatch(re) => &self.all - self.ids_regex(&filter.column, re),
        }
    }

    fn ids_equals(&self, column: &str, value: &str) -> RoaringBitmap {
        if value.is_empty() {
            // Empty value matches series without the label
            return &self.all - self.ids_with_label(column);
        }
        self.postings
            .get(&(Arc::from(column), Arc::from(value)))
            .cloned()
            .unwrap_or_default()
    }

    fn ids_regex(&self, column: &str, re: &Regex) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        for ((name, value), ids) in &self.postings {
            if name.as_ref() == column && re.is_match(value) {
                result |= ids;
            }
        }
        if re.is_match("") {
            result |= &self.all - self.ids_with_label(column);
        }
        result
    }

    fn ids_with_label(&self, column: &str) -> RoaringBitmap {
        let mut result = RoaringBitmap::new();
        for ((name, _), ids) in &self.postings {
            if name.as_ref() == column {
                result |= ids;
            }
        }
        result
    }

    /// Distinct values of a label, sorted.
    pub fn label_values(&self, column: &str) -> Vec<String> {
        let mut values: Vec<String> = self
            .postings
            .keys()
            .filter(|(name, _)| name.as_ref() == column)
            .map(|(_, value)| value.to_string())
            .collect();
        values.sort();
        values
    }

    /// Distinct label names, sorted.
    pub fn label_names(&self) -> Vec<String> {
        let mut names: HashSet<&str> = HashSet::new();
        for (name, _) in self.postings.keys() {
            names.insert(name);
        }
        let mut names: Vec<String> = names.into_iter().map(String::from).collect();
        names.sort();
        names
    }

    /// Committed partition count
    pub fn num_partitions(&self) -> u64 {
        self.all.len()
    }
}

/// Inverted index with staged commits
pub struct PartKeyIndex {
    committed: RwLock<Arc<IndexSnapshot>>,
    staged: Mutex<Vec<(u32, Labels)>>,
    interner: Mutex<HashSet<Arc<str>>>,
}

impl Default for PartKeyIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PartKeyIndex {
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(Arc::new(IndexSnapshot::default())),
            staged: Mutex::new(Vec::new()),
            interner: Mutex::new(HashSet::new()),
        }
    }

    /// Stage a new partition's labels. Not searchable until [`commit`](Self::commit).
    pub fn add_partition(&self, part_id: u32, labels: Labels) {
        self.staged.lock().push((part_id, labels));
    }

    /// Make all staged partitions searchable. Copy-on-write: in-flight
    /// snapshots are untouched.
    pub fn commit(&self) {
        // Holding the staged lock serializes concurrent commits
        let mut staged_guard = self.staged.lock();
        if staged_guard.is_empty() {
            return;
        }
        let staged: Vec<(u32, Labels)> = std::mem::take(&mut *staged_guard);
        let current = self.committed.read().clone();
        let mut next = IndexSnapshot {
            postings: current.postings.clone(),
            all: current.all.clone(),
        };
        let mut interner = self.interner.lock();
        for (part_id, labels) in staged {
            next.all.insert(part_id);
            for (name, value) in labels {
                let name = intern(&mut interner, &name);
                let value = intern(&mut interner, &value);
                next.postings.entry((name, value)).or_default().insert(part_id);
            }
        }
        *self.committed.write() = Arc::new(next);
    }

    /// Immutable snapshot for one query.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.committed.read().clone()
    }
}

fn intern(interner: &mut HashSet<Arc<str>>, s: &str) -> Arc<str> {
    if let Some(existing) = interner.get(s) {
        return existing.clone();
    }
    let arc: Arc<str> = Arc::from(s);
    interner.insert(arc.clone());
    arc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn test_index() -> PartKeyIndex {
        let index = PartKeyIndex::new();
        index.add_partition(1, labels(&[("__name__", "heap"), ("app", "a"), ("dc", "dc1")]));
        index.add_partition(2, labels(&[("__name__", "heap"), ("app", "b"), ("dc", "dc1")]));
        index.add_partition(3, labels(&[("__name__", "cpu"), ("app", "a"), ("dc", "dc2")]));
        index.add_partition(4, labels(&[("__name__", "cpu"), ("app", "c")]));
        index.commit();
        index
    }

    #[test]
    fn staged_partitions_invisible_until_commit() {
        let index = PartKeyIndex::new();
        index.add_partition(1, labels(&[("app", "a")]));
        let before = index.snapshot();
        assert_eq!(before.num_partitions(), 0);
        index.commit();
        assert_eq!(index.snapshot().num_partitions(), 1);
        // the old snapshot is unchanged
        assert_eq!(before.num_partitions(), 0);
    }

    #[test]
    fn equals_and_conjunction() {
        let snap = test_index().snapshot();
        let ids = snap.ids_matching(&[ColumnFilter::equals("app", "a")]);
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![1, 3]);

        let ids = snap.ids_matching(&[
            ColumnFilter::equals("app", "a"),
            ColumnFilter::equals("dc", "dc1"),
        ]);
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn not_equals_includes_missing_label() {
        let snap = test_index().snapshot();
        let ids = snap.ids_matching(&[ColumnFilter::not_equals("dc", "dc1")]);
        // partition 4 has no dc label; "" != "dc1"
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn equals_empty_matches_missing_label() {
        let snap = test_index().snapshot();
        let ids = snap.ids_matching(&[ColumnFilter::equals("dc", "")]);
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn regex_is_anchored() {
        let snap = test_index().snapshot();
        let ids = snap.ids_matching(&[ColumnFilter::regex_match("dc", "dc").unwrap()]);
        assert!(ids.is_empty(), "unanchored substring must not match");
        let ids = snap.ids_matching(&[ColumnFilter::regex_match("dc", "dc[0-9]").unwrap()]);
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn regex_not_match() {
        let snap = test_index().snapshot();
        let ids = snap.ids_matching(&[ColumnFilter::regex_not_match("app", "a|b").unwrap()]);
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn disjunction() {
        let snap = test_index().snapshot();
        let ids = snap.ids_matching_any(&[
            ColumnFilter::equals("app", "b"),
            ColumnFilter::equals("app", "c"),
        ]);
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![2, 4]);
    }

    #[test]
    fn label_values_sorted() {
        let snap = test_index().snapshot();
        assert_eq!(snap.label_values("app"), vec!["a", "b", "c"]);
        assert_eq!(snap.label_values("__name__"), vec!["cpu", "heap"]);
        assert!(snap.label_values("missing").is_empty());
    }
}
