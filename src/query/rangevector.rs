//! Range vectors: the currency between exec-plan nodes
//!
//! A range vector is a labeled, time-ordered series of rows. Plan nodes
//! exchange lazy streams of them; a `ResultSchema` travels alongside each
//! stream describing the row shape.

use crate::schema::{ColumnType, HistogramValue, Labels};
use crate::{Error, Result};
use futures::stream::BoxStream;
use std::collections::BTreeMap;

/// Ordered label map identifying one range vector
pub type RangeVectorKey = Labels;

/// One (timestamp, double) row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub ts: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(ts: i64, value: f64) -> Self {
        Self { ts, value }
    }
}

/// One (timestamp, histogram) row
#[derive(Debug, Clone, PartialEq)]
pub struct HistSample {
    pub ts: i64,
    pub value: HistogramValue,
}

/// Row payload of a range vector
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesData {
    Doubles(Vec<Sample>),
    Histograms(Vec<HistSample>),
}

impl SeriesData {
    pub fn len(&self) -> usize {
        match self {
            SeriesData::Doubles(v) => v.len(),
            SeriesData::Histograms(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A labeled, time-ordered row stream
#[derive(Debug, Clone, PartialEq)]
pub struct RangeVector {
    pub key: RangeVectorKey,
    pub data: SeriesData,
}

impl RangeVector {
    pub fn doubles(key: RangeVectorKey, samples: Vec<Sample>) -> Self {
        Self {
            key,
            data: SeriesData::Doubles(samples),
        }
    }

    pub fn histograms(key: RangeVectorKey, samples: Vec<HistSample>) -> Self {
        Self {
            key,
            data: SeriesData::Histograms(samples),
        }
    }

    /// Number of rows
    pub fn num_samples(&self) -> usize {
        self.data.len()
    }

    /// Double samples, or an error for histogram vectors.
    pub fn double_samples(&self) -> Result<&[Sample]> {
        match &self.data {
            SeriesData::Doubles(v) => Ok(v),
            SeriesData::Histograms(_) => Err(Error::SchemaMismatch(
                "expected double rows, found histograms".into(),
            )),
        }
    }

    /// Merge another vector with the identical full label set by
    /// concatenating on timestamp. Used when one series arrives in two
    /// pieces (e.g. raw + downsampled halves of a range).
    pub fn stitch(self, other: RangeVector) -> Result<RangeVector> {
        if self.key != other.key {
            return Err(Error::Internal(
                "stitch requires identical label sets".into(),
            ));
        }
        let data = match (self.data, other.data) {
            (SeriesData::Doubles(a), SeriesData::Doubles(b)) => {
                let mut merged: BTreeMap<i64, Sample> = BTreeMap::new();
                for s in a.into_iter().chain(b) {
                    merged.entry(s.ts).or_insert(s);
                }
                SeriesData::Doubles(merged.into_values().collect())
            }
            (SeriesData::Histograms(a), SeriesData::Histograms(b)) => {
                let mut merged: BTreeMap<i64, HistSample> = BTreeMap::new();
                for s in a.into_iter().chain(b) {
                    merged.entry(s.ts).or_insert(s);
                }
                SeriesData::Histograms(merged.into_values().collect())
            }
            _ => {
                return Err(Error::SchemaMismatch(
                    "cannot stitch double and histogram vectors".into(),
                ))
            }
        };
        Ok(RangeVector {
            key: self.key,
            data,
        })
    }
}

/// Column description travelling with a stream
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Shape of the rows flowing through a stream
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSchema {
    pub columns: Vec<ColumnInfo>,
    /// Rows are (timestamp, value) series
    pub is_time_series: bool,
    /// The value column is a histogram rendered as doubles per bucket
    pub is_histogram_double: bool,
}

impl ResultSchema {
    /// Standard timestamp+double schema
    pub fn time_series(value_column: impl Into<String>) -> Self {
        Self {
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new(value_column, ColumnType::Double),
            ],
            is_time_series: true,
            is_histogram_double: false,
        }
    }

    /// Timestamp+histogram schema
    pub fn histogram_series(value_column: impl Into<String>) -> Self {
        Self {
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new(value_column, ColumnType::Histogram),
            ],
            is_time_series: true,
            is_histogram_double: false,
        }
    }

    /// Label-only schema for metadata results
    pub fn labels_only() -> Self {
        Self {
            columns: vec![],
            is_time_series: false,
            is_histogram_double: false,
        }
    }
}

/// Lazy, cancellable stream of range vectors
pub type RangeVectorStream = BoxStream<'static, Result<RangeVector>>;

/// Schema plus stream: the full result of an exec-plan node
pub struct QueryResult {
    pub schema: ResultSchema,
    pub stream: RangeVectorStream,
}

impl QueryResult {
    pub fn new(schema: ResultSchema, stream: RangeVectorStream) -> Self {
        Self { schema, stream }
    }

    /// An empty result with the given schema
    pub fn empty(schema: ResultSchema) -> Self {
        Self {
            schema,
            stream: Box::pin(futures::stream::empty()),
        }
    }

    /// Drain the stream into a vector (used by tests and buffering nodes).
    pub async fn collect(self) -> Result<Vec<RangeVector>> {
        use futures::TryStreamExt;
        self.stream.try_collect().await
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

    #[test]
    fn stitch_concatenates_on_timestamp() {
        let k = key(&[("app", "x")]);
        let a = RangeVector::doubles(k.clone(), vec![Sample::new(10, 1.0), Sample::new(20, 2.0)]);
        let b = RangeVector::doubles(k.clone(), vec![Sample::new(15, 1.5), Sample::new(30, 3.0)]);
        let merged = a.stitch(b).unwrap();
        let samples = merged.double_samples().unwrap();
        assert_eq!(
            samples.iter().map(|s| s.ts).collect::<Vec<_>>(),
            vec![10, 15, 20, 30]
        );
    }

    #[test]
    fn stitch_prefers_first_on_duplicate_ts() {
        let k = key(&[("app", "x")]);
        let a = RangeVector::doubles(k.clone(), vec![Sample::new(10, 1.0)]);
        let b = RangeVector::doubles(k.clone(), vec![Sample::new(10, 99.0)]);
        let merged = a.stitch(b).unwrap();
        assert_eq!(merged.double_samples().unwrap()[0].value, 1.0);
    }

    #[test]
    fn stitch_rejects_different_keys() {
        let a = RangeVector::doubles(key(&[("app", "x")]), vec![]);
        let b = RangeVector::doubles(key(&[("app", "y")]), vec![]);
        assert!(a.stitch(b).is_err());
    }
}
