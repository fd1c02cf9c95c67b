//! Dataset and schema definitions
//!
//! A dataset is a named schema plus downsample configuration, immutable once
//! created. Schemas describe an ordered list of columns: the first column is
//! always the timestamp, the rest are value columns. Partition-key columns
//! (the label set) are carried separately as serialized bytes, see
//! [`PartitionKey`].

mod partkey;
mod record;

pub use partkey::{Labels, PartitionKey};
pub use record::{FieldValue, IngestRecord, RecordBuilder, RecordContainer};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Semantic column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Millisecond epoch timestamps, strictly increasing within a partition
    Timestamp,
    /// 64-bit floats, optionally counter-semantic
    Double,
    /// Bucketed histograms with a per-chunk bucket scheme
    Histogram,
    /// UTF-8 strings
    Utf8,
    /// Integer-keyed maps (legacy bucket representation)
    IntMap,
}

/// Column definition within a schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column id, stable across the dataset's lifetime
    pub id: u16,
    /// Column name
    pub name: String,
    /// Semantic type
    pub column_type: ColumnType,
    /// Counter semantics: monotonically increasing, dips mean resets
    pub counter: bool,
}

impl ColumnDef {
    /// Create a new column definition
    pub fn new(id: u16, name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            id,
            name: name.into(),
            column_type,
            counter: false,
        }
    }

    /// Mark this column as a counter
    pub fn counter(mut self) -> Self {
        self.counter = true;
        self
    }
}

/// Downsampling operators, applied per configured output column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownsamplerKind {
    Min,
    Max,
    Sum,
    Count,
    /// Arithmetic mean of the raw values in the period
    Avg,
    /// Merge already-downsampled averages using their paired counts
    AvgFromAvgCount,
    /// Recompute average from downsampled sum and count columns
    AvgFromSumCount,
    /// Last raw value in the period
    LastValue,
    /// Bucket-wise histogram sum
    HistogramSum,
    /// The period-end timestamp itself
    Timestamp,
}

impl DownsamplerKind {
    /// Output column type produced by this downsampler
    pub fn output_type(&self) -> ColumnType {
        match self {
            DownsamplerKind::Timestamp => ColumnType::Timestamp,
            DownsamplerKind::HistogramSum => ColumnType::Histogram,
            _ => ColumnType::Double,
        }
    }
}

/// One downsampler wired to its input column ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownsamplerSpec {
    /// Operator
    pub kind: DownsamplerKind,
    /// Input column ids, in the order the operator consumes them
    pub inputs: Vec<u16>,
}

impl DownsamplerSpec {
    pub fn new(kind: DownsamplerKind, inputs: Vec<u16>) -> Self {
        Self { kind, inputs }
    }
}

/// Ordered column list; column 0 is the timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Schema name, referenced by downsampler config
    pub name: String,
    /// Columns; index 0 must be the timestamp column
    pub columns: Vec<ColumnDef>,
}

impl Schema {
    /// Create a schema, validating the timestamp position.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Result<Self> {
        let name = name.into();
        if columns.first().map(|c| c.column_type) != Some(ColumnType::Timestamp) {
            return Err(Error::SchemaMismatch(format!(
                "schema {name}: column 0 must be the timestamp"
            )));
        }
        if columns
            .iter()
            .skip(1)
            .any(|c| c.column_type == ColumnType::Timestamp)
        {
            return Err(Error::SchemaMismatch(format!(
                "schema {name}: exactly one timestamp column allowed"
            )));
        }
        Ok(Self { name, columns })
    }

    /// The timestamp column definition
    pub fn timestamp_column(&self) -> &ColumnDef {
        &self.columns[0]
    }

    /// Value columns, in schema order
    pub fn data_columns(&self) -> &[ColumnDef] {
        &self.columns[1..]
    }

    /// Look up a column by name
    pub fn column_by_name(&self, name: &str) -> Result<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::UndefinedColumn(name.to_string()))
    }

    /// Look up a column by id
    pub fn column_by_id(&self, id: u16) -> Result<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::UndefinedColumn(format!("column id {id}")))
    }

    /// Prometheus gauge schema: timestamp + double value
    pub fn prom_gauge() -> Arc<Self> {
        Arc::new(
            Self::new(
                "prom-gauge",
                vec![
                    ColumnDef::new(0, "timestamp", ColumnType::Timestamp),
                    ColumnDef::new(1, "value", ColumnType::Double),
                ],
            )
            .expect("static schema"),
        )
    }

    /// Prometheus counter schema: timestamp + counter double
    pub fn prom_counter() -> Arc<Self> {
        Arc::new(
            Self::new(
                "prom-counter",
                vec![
                    ColumnDef::new(0, "timestamp", ColumnType::Timestamp),
                    ColumnDef::new(1, "value", ColumnType::Double).counter(),
                ],
            )
            .expect("static schema"),
        )
    }

    /// Prometheus histogram schema: timestamp + bucketed histogram
    pub fn prom_histogram() -> Arc<Self> {
        Arc::new(
            Self::new(
                "prom-histogram",
                vec![
                    ColumnDef::new(0, "timestamp", ColumnType::Timestamp),
                    ColumnDef::new(1, "h", ColumnType::Histogram),
                ],
            )
            .expect("static schema"),
        )
    }

    /// Downsampled gauge schema: timestamp + min/max/sum/count/avg
    pub fn downsample_gauge() -> Arc<Self> {
        Arc::new(
            Self::new(
                "ds-gauge",
                vec![
                    ColumnDef::new(0, "timestamp", ColumnType::Timestamp),
                    ColumnDef::new(1, "min", ColumnType::Double),
                    ColumnDef::new(2, "max", ColumnType::Double),
                    ColumnDef::new(3, "sum", ColumnType::Double),
                    ColumnDef::new(4, "count", ColumnType::Double),
                    ColumnDef::new(5, "avg", ColumnType::Double),
                ],
            )
            .expect("static schema"),
        )
    }
}

/// A bucketed histogram value: explicit upper bounds plus cumulative counts.
///
/// `bounds[i]` is the inclusive upper edge of bucket `i`; the last bound is
/// `f64::INFINITY`. Counts are cumulative, Prometheus-style.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramValue {
    /// Bucket upper bounds, shared across rows with the same scheme
    pub bounds: Arc<Vec<f64>>,
    /// Cumulative count per bucket, same length as `bounds`
    pub counts: Vec<f64>,
}

impl HistogramValue {
    pub fn new(bounds: Arc<Vec<f64>>, counts: Vec<f64>) -> Self {
        debug_assert_eq!(bounds.len(), counts.len());
        Self { bounds, counts }
    }

    /// Number of buckets
    pub fn num_buckets(&self) -> usize {
        self.bounds.len()
    }

    /// Total observation count (the +Inf bucket)
    pub fn total(&self) -> f64 {
        self.counts.last().copied().unwrap_or(f64::NAN)
    }

    /// Bucket-wise sum of two histograms with identical schemes.
    pub fn merge(&mut self, other: &HistogramValue) -> Result<()> {
        if self.bounds != other.bounds {
            return Err(Error::SchemaMismatch(
                "histogram bucket schemes differ".into(),
            ));
        }
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += b;
        }
        Ok(())
    }
}

/// Immutable dataset definition: schema + downsample wiring
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Dataset name
    pub name: String,
    /// Column schema
    pub schema: Arc<Schema>,
    /// Downsamplers applied when this dataset feeds a lower resolution
    pub downsamplers: Vec<DownsamplerSpec>,
}

impl Dataset {
    /// Create a dataset with no downsample wiring
    pub fn new(name: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            name: name.into(),
            schema,
            downsamplers: Vec::new(),
        }
    }

    /// Attach downsampler specs
    pub fn with_downsamplers(mut self, downsamplers: Vec<DownsamplerSpec>) -> Self {
        self.downsamplers = downsamplers;
        self
    }

    /// Reference handle for directory keys
    pub fn dataset_ref(&self) -> DatasetRef {
        DatasetRef::from(self.name.as_str())
    }
}

/// Cheap, hashable handle naming a dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetRef(Arc<str>);

impl DatasetRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DatasetRef {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for DatasetRef {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_requires_leading_timestamp() {
        let err = Schema::new(
            "bad",
            vec![ColumnDef::new(0, "value", ColumnType::Double)],
        );
        assert!(err.is_err());
    }

    #[test]
    fn schema_rejects_second_timestamp() {
        let err = Schema::new(
            "bad",
            vec![
                ColumnDef::new(0, "timestamp", ColumnType::Timestamp),
                ColumnDef::new(1, "ts2", ColumnType::Timestamp),
            ],
        );
        assert!(err.is_err());
    }

    #[test]
    fn column_lookup_by_name_and_id() {
        let schema = Schema::prom_gauge();
        assert_eq!(schema.column_by_name("value").unwrap().id, 1);
        assert_eq!(schema.column_by_id(0).unwrap().name, "timestamp");
        assert!(matches!(
            schema.column_by_name("nope"),
            Err(Error::UndefinedColumn(_))
        ));
    }

    #[test]
    fn histogram_merge_requires_same_scheme() {
        let bounds = Arc::new(vec![10.0, 100.0, f64::INFINITY]);
        let mut a = HistogramValue::new(bounds.clone(), vec![1.0, 2.0, 3.0]);
        let b = HistogramValue::new(bounds, vec![1.0, 1.0, 1.0]);
        a.merge(&b).unwrap();
        assert_eq!(a.counts, vec![2.0, 3.0, 4.0]);

        let other = HistogramValue::new(Arc::new(vec![1.0, f64::INFINITY]), vec![0.0, 0.0]);
        assert!(a.merge(&other).is_err());
    }
}
