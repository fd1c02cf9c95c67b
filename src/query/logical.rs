//! Logical query plans
//!
//! An immutable tree of plan nodes, normally produced by a PromQL-style
//! front end; embedders may also build plans directly. Plan walking is an
//! exhaustive match over the tagged enum rather than a visitor hierarchy.

use crate::memstore::ColumnFilter;
use crate::schema::DatasetRef;

/// Arithmetic and set operators for joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    /// Set operators join whole series rather than combining values
    pub fn is_set_op(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }

    /// Apply an arithmetic operator. NaN in either operand yields NaN.
    pub fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Mod => lhs % rhs,
            BinaryOp::Pow => lhs.powf(rhs),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Unless => f64::NAN,
        }
    }
}

/// Join cardinality rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Aggregation operators
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Stddev,
    Stdvar,
    TopK(usize),
    BottomK(usize),
    Quantile(f64),
    CountValues(String),
    Group,
}

impl AggregateOp {
    /// Whether per-shard partials merged with the same operator equal the
    /// global result (safe for two-level reduction).
    pub fn is_associative(&self) -> bool {
        matches!(
            self,
            AggregateOp::Sum | AggregateOp::Min | AggregateOp::Max | AggregateOp::Group
        )
    }
}

/// Window (range-vector) functions
#[derive(Debug, Clone, PartialEq)]
pub enum RangeFunction {
    Rate,
    Irate,
    Increase,
    Delta,
    SumOverTime,
    AvgOverTime,
    CountOverTime,
    MinOverTime,
    MaxOverTime,
    StddevOverTime,
    StdvarOverTime,
    QuantileOverTime(f64),
    /// Latest sample in the window (instant-vector selection)
    Last,
}

impl RangeFunction {
    /// Counter functions apply reset correction
    pub fn is_counter_fn(&self) -> bool {
        matches!(
            self,
            RangeFunction::Rate | RangeFunction::Irate | RangeFunction::Increase
        )
    }

    /// Functions computable per chunk from the reader's range primitives
    pub fn is_chunked_capable(&self) -> bool {
        matches!(
            self,
            RangeFunction::SumOverTime
                | RangeFunction::CountOverTime
                | RangeFunction::AvgOverTime
                | RangeFunction::MinOverTime
                | RangeFunction::MaxOverTime
        )
    }
}

/// Per-sample instant functions
#[derive(Debug, Clone, PartialEq)]
pub enum InstantFunction {
    Abs,
    Ceil,
    Exp,
    Floor,
    Ln,
    Log10,
    Log2,
    Round,
    Sqrt,
    ClampMin(f64),
    ClampMax(f64),
    /// Interpolated quantile over prom-schema bucket series
    HistogramQuantile(f64),
}

/// Miscellaneous vector functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiscFunction {
    /// Expand histogram vectors into one `_bucket` series per `le`
    HistToPromVectors,
}

/// Time-derived scalar generators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarTimeFunction {
    /// Step timestamp in seconds
    Time,
    Hour,
    Minute,
    DayOfWeek,
}

/// Logical plan nodes
#[derive(Debug, Clone)]
pub enum LogicalPlan {
    /// Raw chunk scan over a series selector
    RawSeries {
        dataset: DatasetRef,
        filters: Vec<ColumnFilter>,
        /// Value columns to read; empty means the schema's first value column
        columns: Vec<String>,
        start: i64,
        end: i64,
    },
    /// Chunk metadata (id, rows, time range) for a selector
    RawChunkMeta {
        dataset: DatasetRef,
        filters: Vec<ColumnFilter>,
        start: i64,
        end: i64,
    },
    /// Sample the raw stream at step boundaries with default lookback
    PeriodicSeries {
        raw: Box<LogicalPlan>,
        start: i64,
        step: i64,
        end: i64,
    },
    /// Apply a range function over a sliding window at each step
    PeriodicSeriesWithWindowing {
        raw: Box<LogicalPlan>,
        start: i64,
        step: i64,
        end: i64,
        window: i64,
        function: RangeFunction,
    },
    /// Grouped aggregation
    Aggregate {
        op: AggregateOp,
        inner: Box<LogicalPlan>,
        by: Vec<String>,
        without: Vec<String>,
    },
    /// Vector-vector join (arithmetic or set operator)
    BinaryJoin {
        lhs: Box<LogicalPlan>,
        op: BinaryOp,
        cardinality: Cardinality,
        rhs: Box<LogicalPlan>,
        on: Vec<String>,
        ignoring: Vec<String>,
        /// Labels copied from the "one" side in 1:N / N:1 joins
        include: Vec<String>,
    },
    /// Scalar-vector arithmetic
    ScalarVectorBinaryOperation {
        scalar: Box<LogicalPlan>,
        vector: Box<LogicalPlan>,
        op: BinaryOp,
        scalar_is_lhs: bool,
    },
    ApplyInstantFunction {
        inner: Box<LogicalPlan>,
        function: InstantFunction,
    },
    ApplyMiscellaneousFunction {
        inner: Box<LogicalPlan>,
        function: MiscFunction,
    },
    ApplySortFunction {
        inner: Box<LogicalPlan>,
        descending: bool,
    },
    /// `absent()`: emit a synthetic series when the inner plan yields nothing
    ApplyAbsentFunction {
        inner: Box<LogicalPlan>,
        filters: Vec<ColumnFilter>,
        start: i64,
        step: i64,
        end: i64,
    },
    /// `vector(scalar)`: lift a scalar into a joinable vector
    VectorPlan { scalar: Box<LogicalPlan> },
    /// Fixed scalar over the step grid
    ScalarFixedDouble {
        value: f64,
        start: i64,
        step: i64,
        end: i64,
    },
    /// `scalar(vector)`: the single series' value per step, else NaN
    ScalarVaryingDouble { inner: Box<LogicalPlan> },
    /// Time-derived scalar over the step grid
    ScalarTimeBased {
        function: ScalarTimeFunction,
        start: i64,
        step: i64,
        end: i64,
    },
    /// Scalar-scalar arithmetic
    ScalarBinaryOperation {
        lhs: Box<LogicalPlan>,
        rhs: Box<LogicalPlan>,
        op: BinaryOp,
    },
    /// Metadata: distinct values of one label
    LabelValues {
        dataset: DatasetRef,
        label: String,
        filters: Vec<ColumnFilter>,
    },
    /// Metadata: series keys matching filters
    SeriesKeysByFilters {
        dataset: DatasetRef,
        filters: Vec<ColumnFilter>,
        start: i64,
        end: i64,
    },
}

impl LogicalPlan {
    /// Child plans in left-to-right order
    pub fn children(&self) -> Vec<&LogicalPlan> {
        match self {
            LogicalPlan::RawSeries { .. }
            | LogicalPlan::RawChunkMeta { .. }
            | LogicalPlan::ScalarFixedDouble { .. }
            | LogicalPlan::ScalarTimeBased { .. }
            | LogicalPlan::LabelValues { .. }
            | LogicalPlan::SeriesKeysByFilters { .. } => vec![],
            LogicalPlan::PeriodicSeries { raw, .. }
            | LogicalPlan::PeriodicSeriesWithWindowing { raw, .. } => vec![raw],
            LogicalPlan::Aggregate { inner, .. }
            | LogicalPlan::ApplyInstantFunction { inner, .. }
            | LogicalPlan::ApplyMiscellaneousFunction { inner, .. }
            | LogicalPlan::ApplySortFunction { inner, .. }
            | LogicalPlan::ApplyAbsentFunction { inner, .. }
            | LogicalPlan::ScalarVaryingDouble { inner } => vec![inner],
            LogicalPlan::VectorPlan { scalar } => vec![scalar],
            LogicalPlan::BinaryJoin { lhs, rhs, .. }
            | LogicalPlan::ScalarBinaryOperation { lhs, rhs, .. } => vec![lhs, rhs],
            LogicalPlan::ScalarVectorBinaryOperation { scalar, vector, .. } => {
                vec![scalar, vector]
            }
        }
    }

    /// All leaf nodes, left to right.
    pub fn find_leaves(&self) -> Vec<&LogicalPlan> {
        let children = self.children();
        if children.is_empty() {
            return vec![self];
        }
        children.iter().flat_map(|c| c.find_leaves()).collect()
    }

    /// The `(start, end)` range carried by leaf nodes, if any
    pub fn time_range(&self) -> Option<(i64, i64)> {
        match self {
            LogicalPlan::RawSeries { start, end, .. }
            | LogicalPlan::RawChunkMeta { start, end, .. }
            | LogicalPlan::SeriesKeysByFilters { start, end, .. } => Some((*start, *end)),
            LogicalPlan::PeriodicSeries { start, end, .. }
            | LogicalPlan::PeriodicSeriesWithWindowing { start, end, .. }
            | LogicalPlan::ScalarFixedDouble { start, end, .. }
            | LogicalPlan::ScalarTimeBased { start, end, .. } => Some((*start, *end)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::ColumnFilter;

    fn raw(name: &str) -> LogicalPlan {
        LogicalPlan::RawSeries {
            dataset: DatasetRef::from("metrics"),
            filters: vec![ColumnFilter::equals("__name__", name)],
            columns: vec![],
            start: 0,
            end: 100,
        }
    }

    #[test]
    fn find_leaves_left_to_right() {
        let plan = LogicalPlan::BinaryJoin {
            lhs: Box::new(LogicalPlan::PeriodicSeries {
                raw: Box::new(raw("a")),
                start: 0,
                step: 10,
                end: 100,
            }),
            op: BinaryOp::Add,
            cardinality: Cardinality::OneToOne,
            rhs: Box::new(raw("b")),
            on: vec![],
            ignoring: vec![],
            include: vec![],
        };
        let leaves = plan.find_leaves();
        assert_eq!(leaves.len(), 2);
        match (leaves[0], leaves[1]) {
            (
                LogicalPlan::RawSeries { filters: f1, .. },
                LogicalPlan::RawSeries { filters: f2, .. },
            ) => {
                assert!(format!("{f1:?}").contains('a'));
                assert!(format!("{f2:?}").contains('b'));
            }
            _ => panic!("expected raw leaves"),
        }
    }

    #[test]
    fn set_op_classification() {
        assert!(BinaryOp::And.is_set_op());
        assert!(BinaryOp::Unless.is_set_op());
        assert!(!BinaryOp::Add.is_set_op());
    }

    #[test]
    fn associative_ops() {
        assert!(AggregateOp::Sum.is_associative());
        assert!(!AggregateOp::Avg.is_associative());
        assert!(!AggregateOp::Count.is_associative());
    }
}
