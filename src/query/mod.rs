//! Query engine
//!
//! Logical plans (built programmatically or by a PromQL front end) are
//! materialized into physical exec-plan trees and run against the memstore.
//! Results flow back as lazy streams of range vectors under a per-query
//! session enforcing deadline, cancellation, and sample limits.

mod aggregate;
mod binary;
mod exec;
mod logical;
mod planner;
mod rangefns;
mod rangevector;
mod transformers;

pub use aggregate::{aggregate as aggregate_vectors, project_key};
pub use binary::{binary_join, join_keys, set_operation};
pub use exec::{
    pick_dispatcher, BinaryJoinExec, ExecPlan, GenerateScalarExec, LabelValuesExec,
    LocalPartitionDistConcatExec, PartKeysExec, PlanDispatcher, QuerySession,
    ReduceAggregateExec, ScalarSource, ScalarVaryingExec, ScalarVectorBinaryExec,
    SelectChunkMetasExec, SelectRawPartitionsExec, SetOperatorExec,
};
pub use logical::{
    AggregateOp, BinaryOp, Cardinality, InstantFunction, LogicalPlan, MiscFunction,
    RangeFunction, ScalarTimeFunction,
};
pub use planner::Planner;
pub use rangefns::{evaluate as evaluate_range_function, ChunkedAccumulator};
pub use rangevector::{
    ColumnInfo, HistSample, QueryResult, RangeVector, RangeVectorKey, RangeVectorStream,
    ResultSchema, Sample, SeriesData,
};
pub use transformers::{
    hist_to_prom_vectors, histogram_quantile, PeriodicSamplesMapper, RangeVectorTransformer,
    DEFAULT_LOOKBACK_MS,
};

use crate::memstore::TimeSeriesMemStore;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied query parameters; unset fields fall back to `Settings`
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub query_id: String,
    pub sample_limit: Option<usize>,
    pub timeout: Option<Duration>,
}

impl QueryContext {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            ..Default::default()
        }
    }
}

/// Facade tying the planner and exec runtime to one memstore
pub struct QueryEngine {
    store: Arc<TimeSeriesMemStore>,
    planner: Planner,
}

impl QueryEngine {
    pub fn new(store: Arc<TimeSeriesMemStore>) -> Self {
        let planner = Planner::new(store.clone());
        Self { store, planner }
    }

    /// Materialize a logical plan without running it.
    pub fn materialize(&self, plan: &LogicalPlan) -> Result<Arc<dyn ExecPlan>> {
        self.planner.materialize(plan)
    }

    /// Open a session for one query.
    pub fn session(&self, ctx: &QueryContext) -> Arc<QuerySession> {
        let defaults = &self.store.settings().query;
        QuerySession::new(
            ctx.query_id.clone(),
            ctx.timeout.unwrap_or(defaults.ask_timeout),
            ctx.sample_limit.unwrap_or(defaults.sample_limit),
        )
    }

    /// Materialize and execute, returning the schema and lazy stream.
    pub async fn exec_logical_plan(
        &self,
        plan: &LogicalPlan,
        ctx: &QueryContext,
    ) -> Result<QueryResult> {
        let exec = self.materialize(plan)?;
        let session = self.session(ctx);
        exec.execute(self.store.clone(), session).await
    }

    /// Convenience: execute and collect every vector.
    pub async fn run(
        &self,
        plan: &LogicalPlan,
        ctx: &QueryContext,
    ) -> Result<(ResultSchema, Vec<RangeVector>)> {
        let result = self.exec_logical_plan(plan, ctx).await?;
        let schema = result.schema.clone();
        let vectors = result.collect().await?;
        Ok((schema, vectors))
    }
}
