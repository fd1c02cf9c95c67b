//! Logical-to-physical plan materialization
//!
//! Raw selectors fan out into one leaf scan per resident shard under a concat
//! node. Per-vector transformers push down onto the still-distributed leaves;
//! operations needing global vision (sort, absent, scalar-from-vector,
//! histogram_quantile, final aggregation, joins) gather to a single node
//! whose dispatcher comes from `pick_dispatcher`.

use super::exec::{
    BinaryJoinExec, ExecPlan, GenerateScalarExec, LabelValuesExec, LocalPartitionDistConcatExec,
    PartKeysExec, ReduceAggregateExec, ScalarSource, ScalarVaryingExec, ScalarVectorBinaryExec,
    SelectChunkMetasExec, SelectRawPartitionsExec, SetOperatorExec,
};
use super::logical::{InstantFunction, LogicalPlan, RangeFunction};
use super::transformers::{PeriodicSamplesMapper, RangeVectorTransformer, DEFAULT_LOOKBACK_MS};
use crate::memstore::{ColumnFilter, TimeSeriesMemStore};
use crate::schema::DatasetRef;
use crate::{Error, Result};
use std::sync::Arc;

/// Materializes logical plans against the shards resident in one memstore
pub struct Planner {
    store: Arc<TimeSeriesMemStore>,
}

/// Intermediate materialization state: raw leaves stay per-shard (and
/// mutable) until an operation forces a gather.
enum Built {
    FanOut(Vec<SelectRawPartitionsExec>),
    Single(Arc<dyn ExecPlan>),
}

impl Built {
    /// Freeze into a single exec node.
    fn finish(self) -> Arc<dyn ExecPlan> {
        match self {
            Built::Single(node) => node,
            Built::FanOut(mut leaves) => {
                if leaves.len() == 1 {
                    Arc::new(leaves.remove(0))
                } else {
                    Arc::new(LocalPartitionDistConcatExec {
                        children: leaves
                            .into_iter()
                            .map(|l| Arc::new(l) as Arc<dyn ExecPlan>)
                            .collect(),
                        transformers: Vec::new(),
                    })
                }
            }
        }
    }

    /// Per-shard children for join-style nodes that gather sides themselves.
    fn into_children(self) -> Vec<Arc<dyn ExecPlan>> {
        match self {
            Built::Single(node) => vec![node],
            Built::FanOut(leaves) => leaves
                .into_iter()
                .map(|l| Arc::new(l) as Arc<dyn ExecPlan>)
                .collect(),
        }
    }

    /// Attach a per-vector transformer, staying distributed when possible.
    fn push_streaming(self, t: RangeVectorTransformer) -> Built {
        match self {
            Built::FanOut(mut leaves) => {
                for leaf in &mut leaves {
                    leaf.transformers.push(t.clone());
                }
                Built::FanOut(leaves)
            }
            Built::Single(node) => Built::Single(Arc::new(LocalPartitionDistConcatExec {
                children: vec![node],
                transformers: vec![t],
            })),
        }
    }

    /// Attach a transformer that needs every vector in one place.
    fn push_gathered(self, t: RangeVectorTransformer) -> Built {
        let node = self.finish();
        Built::Single(Arc::new(LocalPartitionDistConcatExec {
            children: vec![node],
            transformers: vec![t],
        }))
    }
}

impl Planner {
    pub fn new(store: Arc<TimeSeriesMemStore>) -> Self {
        Self { store }
    }

    /// Walk the logical plan into an exec tree.
    pub fn materialize(&self, plan: &LogicalPlan) -> Result<Arc<dyn ExecPlan>> {
        Ok(self.walk(plan)?.finish())
    }

    fn walk(&self, plan: &LogicalPlan) -> Result<Built> {
        match plan {
            LogicalPlan::RawSeries {
                dataset,
                filters,
                columns,
                start,
                end,
            } => Ok(Built::FanOut(self.raw_leaves(
                dataset,
                filters,
                columns,
                *start,
                *end,
                None,
            )?)),

            LogicalPlan::RawChunkMeta {
                dataset,
                filters,
                start,
                end,
            } => {
                let children: Vec<Arc<dyn ExecPlan>> = self
                    .shard_numbers(dataset)?
                    .into_iter()
                    .map(|shard| {
                        Arc::new(SelectChunkMetasExec {
                            dataset: dataset.clone(),
                            shard,
                            filters: filters.clone(),
                            start: *start,
                            end: *end,
                            transformers: Vec::new(),
                        }) as Arc<dyn ExecPlan>
                    })
                    .collect();
                Ok(Built::Single(Arc::new(LocalPartitionDistConcatExec {
                    children,
                    transformers: Vec::new(),
                })))
            }

            LogicalPlan::PeriodicSeries {
                raw,
                start,
                step,
                end,
            } => self.periodic(raw, *start, *step, *end, None, None),

            LogicalPlan::PeriodicSeriesWithWindowing {
                raw,
                start,
                step,
                end,
                window,
                function,
            } => self.periodic(raw, *start, *step, *end, Some(*window), Some(function.clone())),

            LogicalPlan::Aggregate {
                op,
                inner,
                by,
                without,
            } => {
                let mut built = self.walk(inner)?;
                // Per-shard partial reduction where merging with the same
                // operator is sound
                if op.is_associative() && matches!(built, Built::FanOut(_)) {
                    built = built.push_streaming(RangeVectorTransformer::AggregatePartial {
                        op: op.clone(),
                        by: by.clone(),
                        without: without.clone(),
                    });
                }
                Ok(Built::Single(Arc::new(ReduceAggregateExec {
                    op: op.clone(),
                    by: by.clone(),
                    without: without.clone(),
                    children: built.into_children(),
                    transformers: Vec::new(),
                })))
            }

            LogicalPlan::BinaryJoin {
                lhs,
                op,
                cardinality,
                rhs,
                on,
                ignoring,
                include,
            } => {
                let lhs_children = self.walk(lhs)?.into_children();
                let rhs_children = self.walk(rhs)?.into_children();
                if op.is_set_op() {
                    Ok(Built::Single(Arc::new(SetOperatorExec {
                        lhs: lhs_children,
                        rhs: rhs_children,
                        op: *op,
                        on: on.clone(),
                        ignoring: ignoring.clone(),
                        transformers: Vec::new(),
                    })))
                } else {
                    Ok(Built::Single(Arc::new(BinaryJoinExec {
                        lhs: lhs_children,
                        rhs: rhs_children,
                        op: *op,
                        cardinality: *cardinality,
                        on: on.clone(),
                        ignoring: ignoring.clone(),
                        include: include.clone(),
                        transformers: Vec::new(),
                    })))
                }
            }

            LogicalPlan::ScalarVectorBinaryOperation {
                scalar,
                vector,
                op,
                scalar_is_lhs,
            } => {
                let scalar_node = self.walk(scalar)?.finish();
                let vector_node = self.walk(vector)?.finish();
                Ok(Built::Single(Arc::new(ScalarVectorBinaryExec {
                    scalar: scalar_node,
                    vector: vector_node,
                    op: *op,
                    scalar_is_lhs: *scalar_is_lhs,
                    transformers: Vec::new(),
                })))
            }

            LogicalPlan::ApplyInstantFunction { inner, function } => {
                let built = self.walk(inner)?;
                match function {
                    // quantile interpolation needs all bucket series together
                    InstantFunction::HistogramQuantile(_) => Ok(built.push_gathered(
                        RangeVectorTransformer::InstantFunction(function.clone()),
                    )),
                    _ => Ok(built
                        .push_streaming(RangeVectorTransformer::InstantFunction(function.clone()))),
                }
            }

            LogicalPlan::ApplyMiscellaneousFunction { inner, function } => Ok(self
                .walk(inner)?
                .push_streaming(RangeVectorTransformer::Miscellaneous(*function))),

            LogicalPlan::ApplySortFunction { inner, descending } => Ok(self
                .walk(inner)?
                .push_gathered(RangeVectorTransformer::Sort {
                    descending: *descending,
                })),

            LogicalPlan::ApplyAbsentFunction {
                inner,
                filters,
                start,
                step,
                end,
            } => Ok(self.walk(inner)?.push_gathered(RangeVectorTransformer::Absent {
                filters: filters.clone(),
                start: *start,
                step: *step,
                end: *end,
            })),

            LogicalPlan::VectorPlan { scalar } => self.walk(scalar),

            LogicalPlan::ScalarFixedDouble {
                value,
                start,
                step,
                end,
            } => Ok(Built::Single(Arc::new(GenerateScalarExec {
                source: ScalarSource::Fixed(*value),
                start: *start,
                step: *step,
                end: *end,
                transformers: Vec::new(),
            }))),

            LogicalPlan::ScalarTimeBased {
                function,
                start,
                step,
                end,
            } => Ok(Built::Single(Arc::new(GenerateScalarExec {
                source: ScalarSource::Time(*function),
                start: *start,
                step: *step,
                end: *end,
                transformers: Vec::new(),
            }))),

            LogicalPlan::ScalarVaryingDouble { inner } => {
                Ok(Built::Single(Arc::new(ScalarVaryingExec {
                    child: self.walk(inner)?.finish(),
                    transformers: Vec::new(),
                })))
            }

            LogicalPlan::ScalarBinaryOperation { lhs, rhs, op } => {
                let lhs_node = self.walk(lhs)?.finish();
                let rhs_node = self.walk(rhs)?.finish();
                Ok(Built::Single(Arc::new(ScalarVectorBinaryExec {
                    scalar: lhs_node,
                    vector: rhs_node,
                    op: *op,
                    scalar_is_lhs: true,
                    transformers: Vec::new(),
                })))
            }

            LogicalPlan::LabelValues {
                dataset,
                label,
                filters,
            } => {
                let children: Vec<Arc<dyn ExecPlan>> = self
                    .shard_numbers(dataset)?
                    .into_iter()
                    .map(|shard| {
                        Arc::new(LabelValuesExec {
                            dataset: dataset.clone(),
                            shard,
                            label: label.clone(),
                            filters: filters.clone(),
                            transformers: Vec::new(),
                        }) as Arc<dyn ExecPlan>
                    })
                    .collect();
                Ok(Built::Single(Arc::new(LocalPartitionDistConcatExec {
                    children,
                    transformers: Vec::new(),
                })))
            }

            LogicalPlan::SeriesKeysByFilters {
                dataset, filters, ..
            } => {
                let children: Vec<Arc<dyn ExecPlan>> = self
                    .shard_numbers(dataset)?
                    .into_iter()
                    .map(|shard| {
                        Arc::new(PartKeysExec {
                            dataset: dataset.clone(),
                            shard,
                            filters: filters.clone(),
                            transformers: Vec::new(),
                        }) as Arc<dyn ExecPlan>
                    })
                    .collect();
                Ok(Built::Single(Arc::new(LocalPartitionDistConcatExec {
                    children,
                    transformers: Vec::new(),
                })))
            }
        }
    }

    /// Materialize a periodic sampling of a raw selector. The leaf's read
    /// range widens left by the window so the first step sees a full one.
    fn periodic(
        &self,
        raw: &LogicalPlan,
        start: i64,
        step: i64,
        end: i64,
        window: Option<i64>,
        function: Option<RangeFunction>,
    ) -> Result<Built> {
        let LogicalPlan::RawSeries {
            dataset,
            filters,
            columns,
            ..
        } = raw
        else {
            return Err(Error::BadQuery(
                "periodic sampling requires a raw series child".into(),
            ));
        };
        let lookback = window.unwrap_or(DEFAULT_LOOKBACK_MS);
        let mapper = PeriodicSamplesMapper::new(start, step, end, window, function);
        let leaves = self.raw_leaves(
            dataset,
            filters,
            columns,
            start - lookback,
            end,
            Some(mapper),
        )?;
        Ok(Built::FanOut(leaves))
    }

    fn raw_leaves(
        &self,
        dataset: &DatasetRef,
        filters: &[ColumnFilter],
        columns: &[String],
        start: i64,
        end: i64,
        mapper: Option<PeriodicSamplesMapper>,
    ) -> Result<Vec<SelectRawPartitionsExec>> {
        if columns.len() > 1 {
            return Err(Error::BadQuery(
                "raw series scans read a single value column".into(),
            ));
        }
        let column = columns.first().cloned();
        let leaves = self
            .shard_numbers(dataset)?
            .into_iter()
            .map(|shard| {
                let mut leaf = SelectRawPartitionsExec {
                    dataset: dataset.clone(),
                    shard,
                    filters: filters.to_vec(),
                    start,
                    end,
                    column: column.clone(),
                    fused_mapper: None,
                    transformers: Vec::new(),
                };
                match &mapper {
                    Some(m) if m.chunked_eligible() => leaf.fused_mapper = Some(m.clone()),
                    Some(m) => leaf
                        .transformers
                        .push(RangeVectorTransformer::PeriodicSamples(m.clone())),
                    None => {}
                }
                leaf
            })
            .collect();
        Ok(leaves)
    }

    fn shard_numbers(&self, dataset: &DatasetRef) -> Result<Vec<u32>> {
        let shards = self.store.shards(dataset)?;
        if shards.is_empty() {
            return Err(Error::UnknownDataset(format!(
                "{dataset} has no shards on this node"
            )));
        }
        Ok(shards.iter().map(|s| s.shard_num()).collect())
    }
}
