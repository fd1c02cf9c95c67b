//! Physical execution plans
//!
//! An `ExecPlan` node yields a lazy, cancellable stream of range vectors plus
//! a result schema. Leaves scan memstore partitions; non-leaf nodes await
//! child schemas, compose the child streams, and apply their attached
//! transformers in order. Every emitted item passes the session's deadline,
//! cancellation, and sample-limit checks; the first error tears down the
//! whole subtree (child streams are dropped, never half-consumed).

use super::aggregate;
use super::binary;
use super::logical::{AggregateOp, BinaryOp, Cardinality, ScalarTimeFunction};
use super::rangevector::{
    ColumnInfo, QueryResult, RangeVector, RangeVectorKey, RangeVectorStream, ResultSchema, Sample,
};
use super::transformers::{PeriodicSamplesMapper, RangeVectorTransformer};
use crate::memstore::{ColumnFilter, TimeSeriesMemStore};
use crate::schema::{ColumnType, DatasetRef, PartitionKey};
use crate::store::{PartitionScanMethod, TimeRange};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Where a plan node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDispatcher {
    /// Run wherever the parent runs
    InProcess,
    /// Run on the node owning this shard
    Shard(u32),
}

/// Pick a dispatcher for a non-leaf node: one child's dispatcher chosen at
/// random, weighted by that child's subtree size, using the thread RNG.
pub fn pick_dispatcher(children: &[Arc<dyn ExecPlan>]) -> PlanDispatcher {
    if children.is_empty() {
        return PlanDispatcher::InProcess;
    }
    let weights: Vec<usize> = children
        .iter()
        .map(|c| c.children().len().max(1))
        .collect();
    let total: usize = weights.iter().sum();
    let mut pick = rand::thread_rng().gen_range(0..total);
    for (child, weight) in children.iter().zip(&weights) {
        if pick < *weight {
            return child.dispatcher();
        }
        pick -= weight;
    }
    children[0].dispatcher()
}

/// Per-query execution context: deadline, sample budget, cancellation
pub struct QuerySession {
    pub query_id: String,
    pub deadline: Instant,
    pub sample_limit: usize,
    samples_seen: AtomicUsize,
    token: CancellationToken,
}

impl QuerySession {
    pub fn new(query_id: impl Into<String>, timeout: Duration, sample_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            query_id: query_id.into(),
            deadline: Instant::now() + timeout,
            sample_limit,
            samples_seen: AtomicUsize::new(0),
            token: CancellationToken::new(),
        })
    }

    /// Cancellation token shared by the plan tree
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the query; in-flight streams terminate at their next item.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Deadline and cancellation check, called before emitting.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::QueryCancelled);
        }
        if Instant::now() > self.deadline {
            return Err(Error::QueryTimeout);
        }
        Ok(())
    }

    /// Count emitted samples against the budget.
    pub fn account(&self, samples: usize) -> Result<()> {
        let seen = self.samples_seen.fetch_add(samples, Ordering::AcqRel) + samples;
        if seen > self.sample_limit {
            return Err(Error::QueryLimitReached {
                limit: self.sample_limit,
            });
        }
        Ok(())
    }
}

/// Wrap a stream with the session's per-item checks.
fn enforce(session: Arc<QuerySession>, input: RangeVectorStream) -> RangeVectorStream {
    input
        .map(move |item| {
            session.check()?;
            let rv = item?;
            session.account(rv.num_samples())?;
            Ok(rv)
        })
        .boxed()
}

/// A physical plan node
#[async_trait]
pub trait ExecPlan: Send + Sync + fmt::Debug {
    /// Where this node executes
    fn dispatcher(&self) -> PlanDispatcher;

    /// Child plans, empty for leaves
    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        Vec::new()
    }

    /// Transformers applied, in order, to this node's composed stream
    fn transformers(&self) -> &[RangeVectorTransformer];

    /// Node-specific execution, before transformers and enforcement
    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &Arc<QuerySession>,
    ) -> Result<QueryResult>;

    /// Execute the node: run `execute_impl`, apply transformers, enforce the
    /// session's limits on the resulting stream.
    async fn execute(
        &self,
        store: Arc<TimeSeriesMemStore>,
        session: Arc<QuerySession>,
    ) -> Result<QueryResult> {
        session.check()?;
        let result = self.execute_impl(&store, &session).await?;
        let mut schema = result.schema;
        let mut stream = result.stream;
        for t in self.transformers() {
            let (next_schema, next_stream) = t.transform(schema, stream);
            schema = next_schema;
            stream = next_stream;
        }
        Ok(QueryResult::new(schema, enforce(session, stream)))
    }
}

/// Execute children concurrently and require identical schemas.
async fn execute_children(
    children: &[Arc<dyn ExecPlan>],
    store: &Arc<TimeSeriesMemStore>,
    session: &Arc<QuerySession>,
) -> Result<(ResultSchema, Vec<RangeVectorStream>)> {
    let futures: Vec<_> = children
        .iter()
        .map(|c| c.execute(store.clone(), session.clone()))
        .collect();
    let results = futures::future::try_join_all(futures).await?;
    let mut schema: Option<ResultSchema> = None;
    let mut streams = Vec::with_capacity(results.len());
    for result in results {
        match &schema {
            None => schema = Some(result.schema),
            Some(first) => {
                if first.columns != result.schema.columns {
                    return Err(Error::SchemaMismatch(format!(
                        "child schemas differ: {:?} vs {:?}",
                        first.columns, result.schema.columns
                    )));
                }
            }
        }
        streams.push(result.stream);
    }
    Ok((
        schema.unwrap_or_else(|| ResultSchema::time_series("value")),
        streams,
    ))
}

async fn collect_streams(streams: Vec<RangeVectorStream>) -> Result<Vec<RangeVector>> {
    use futures::TryStreamExt;
    let mut vectors = Vec::new();
    for s in streams {
        let mut vs: Vec<RangeVector> = s.try_collect().await?;
        vectors.append(&mut vs);
    }
    Ok(vectors)
}

/// Leaf scan: one shard's matching partitions, one range vector each
pub struct SelectRawPartitionsExec {
    pub dataset: DatasetRef,
    pub shard: u32,
    pub filters: Vec<ColumnFilter>,
    /// Read range; the planner widens the start by the query's window
    pub start: i64,
    pub end: i64,
    /// Value column name; `None` means the schema's first value column
    pub column: Option<String>,
    /// Range-function mapper fused into the scan when the function is
    /// chunk-computable; otherwise the mapper rides in `transformers`
    pub fused_mapper: Option<PeriodicSamplesMapper>,
    pub transformers: Vec<RangeVectorTransformer>,
}

impl fmt::Debug for SelectRawPartitionsExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectRawPartitionsExec")
            .field("shard", &self.shard)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

#[async_trait]
impl ExecPlan for SelectRawPartitionsExec {
    fn dispatcher(&self) -> PlanDispatcher {
        PlanDispatcher::Shard(self.shard)
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        _session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let dataset = store.dataset(&self.dataset)?;
        let ts_shard = store.shard(&self.dataset, self.shard)?;
        let column = match &self.column {
            Some(name) => dataset.schema.column_by_name(name)?.clone(),
            None => dataset
                .schema
                .data_columns()
                .first()
                .ok_or_else(|| Error::SchemaMismatch("schema has no value columns".into()))?
                .clone(),
        };

        if self.fused_mapper.is_some() && column.column_type != ColumnType::Double {
            return Err(Error::BadQuery(format!(
                "range function requires a double column, {} is {:?}",
                column.name, column.column_type
            )));
        }

        // Bias the chunk scan so the chunk holding the earliest relevant
        // sample is included even when its start precedes the query range.
        let scan_range = TimeRange::new(
            self.start.saturating_sub(ts_shard.max_chunk_time_ms()),
            self.end,
        );
        let read_range = TimeRange::new(self.start, self.end);
        let method = PartitionScanMethod::Filtered(self.shard, self.filters.clone());
        let snapshots = ts_shard.scan_partitions(&method, scan_range).await?;

        let mut vectors = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let key: RangeVectorKey =
                PartitionKey::from_bytes(snapshot.part_key.clone()).labels()?;
            let rv = match (&self.fused_mapper, column.column_type) {
                (Some(mapper), ColumnType::Double) => {
                    mapper.map_snapshot_chunked(&snapshot, column.id, key)?
                }
                (_, ColumnType::Double) => RangeVector::doubles(
                    key,
                    snapshot
                        .double_samples(column.id, read_range)?
                        .into_iter()
                        .map(|(ts, v)| Sample::new(ts, v))
                        .collect(),
                ),
                (_, ColumnType::Histogram) => RangeVector::histograms(
                    key,
                    snapshot
                        .histogram_samples(column.id, read_range)?
                        .into_iter()
                        .map(|(ts, value)| super::rangevector::HistSample { ts, value })
                        .collect(),
                ),
                (_, other) => {
                    return Err(Error::SchemaMismatch(format!(
                        "column {} has unsupported scan type {other:?}",
                        column.name
                    )))
                }
            };
            if rv.num_samples() > 0 {
                vectors.push(rv);
            }
        }

        let schema = match column.column_type {
            ColumnType::Histogram => ResultSchema::histogram_series(&column.name),
            _ => ResultSchema::time_series(&column.name),
        };
        Ok(QueryResult::new(
            schema,
            stream::iter(vectors.into_iter().map(Ok)).boxed(),
        ))
    }
}

/// Leaf: chunk metadata for matching partitions
#[derive(Debug)]
pub struct SelectChunkMetasExec {
    pub dataset: DatasetRef,
    pub shard: u32,
    pub filters: Vec<ColumnFilter>,
    pub start: i64,
    pub end: i64,
    pub transformers: Vec<RangeVectorTransformer>,
}

#[async_trait]
impl ExecPlan for SelectChunkMetasExec {
    fn dispatcher(&self) -> PlanDispatcher {
        PlanDispatcher::Shard(self.shard)
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        _session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let ts_shard = store.shard(&self.dataset, self.shard)?;
        let range = TimeRange::new(self.start, self.end);
        let method = PartitionScanMethod::Filtered(self.shard, self.filters.clone());
        let snapshots = ts_shard.scan_partitions(&method, range).await?;

        let mut vectors = Vec::new();
        for snapshot in snapshots {
            let key: RangeVectorKey =
                PartitionKey::from_bytes(snapshot.part_key.clone()).labels()?;
            let samples: Vec<Sample> = snapshot
                .chunks
                .iter()
                .map(|c| Sample::new(c.info.start_time, c.info.num_rows as f64))
                .collect();
            if !samples.is_empty() {
                vectors.push(RangeVector::doubles(key, samples));
            }
        }
        let schema = ResultSchema {
            columns: vec![
                ColumnInfo::new("timestamp", ColumnType::Timestamp),
                ColumnInfo::new("numRows", ColumnType::Double),
            ],
            is_time_series: false,
            is_histogram_double: false,
        };
        Ok(QueryResult::new(
            schema,
            stream::iter(vectors.into_iter().map(Ok)).boxed(),
        ))
    }
}

/// Concatenates per-shard child streams without buffering
pub struct LocalPartitionDistConcatExec {
    pub children: Vec<Arc<dyn ExecPlan>>,
    pub transformers: Vec<RangeVectorTransformer>,
}

impl fmt::Debug for LocalPartitionDistConcatExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPartitionDistConcatExec")
            .field("children", &self.children.len())
            .finish()
    }
}

#[async_trait]
impl ExecPlan for LocalPartitionDistConcatExec {
    fn dispatcher(&self) -> PlanDispatcher {
        pick_dispatcher(&self.children)
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        self.children.clone()
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let (schema, streams) = execute_children(&self.children, store, session).await?;
        Ok(QueryResult::new(schema, stream::select_all(streams).boxed()))
    }
}

/// Cross-shard aggregation reducer. Children emit raw or partially-reduced
/// vectors; this node buffers them and finishes the aggregation.
pub struct ReduceAggregateExec {
    pub op: AggregateOp,
    pub by: Vec<String>,
    pub without: Vec<String>,
    pub children: Vec<Arc<dyn ExecPlan>>,
    pub transformers: Vec<RangeVectorTransformer>,
}

impl fmt::Debug for ReduceAggregateExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReduceAggregateExec")
            .field("op", &self.op)
            .field("children", &self.children.len())
            .finish()
    }
}

#[async_trait]
impl ExecPlan for ReduceAggregateExec {
    fn dispatcher(&self) -> PlanDispatcher {
        pick_dispatcher(&self.children)
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        self.children.clone()
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let (schema, streams) = execute_children(&self.children, store, session).await?;
        let vectors = collect_streams(streams).await?;
        let reduced = aggregate::aggregate(&self.op, vectors, &self.by, &self.without)?;
        Ok(QueryResult::new(
            schema,
            stream::iter(reduced.into_iter().map(Ok)).boxed(),
        ))
    }
}

/// Vector-vector arithmetic join; both sides buffer
pub struct BinaryJoinExec {
    pub lhs: Vec<Arc<dyn ExecPlan>>,
    pub rhs: Vec<Arc<dyn ExecPlan>>,
    pub op: BinaryOp,
    pub cardinality: Cardinality,
    pub on: Vec<String>,
    pub ignoring: Vec<String>,
    pub include: Vec<String>,
    pub transformers: Vec<RangeVectorTransformer>,
}

impl fmt::Debug for BinaryJoinExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryJoinExec")
            .field("op", &self.op)
            .field("cardinality", &self.cardinality)
            .finish()
    }
}

#[async_trait]
impl ExecPlan for BinaryJoinExec {
    fn dispatcher(&self) -> PlanDispatcher {
        let all: Vec<Arc<dyn ExecPlan>> =
            self.lhs.iter().chain(&self.rhs).cloned().collect();
        pick_dispatcher(&all)
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        self.lhs.iter().chain(&self.rhs).cloned().collect()
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let (schema, lhs_streams) = execute_children(&self.lhs, store, session).await?;
        let (_, rhs_streams) = execute_children(&self.rhs, store, session).await?;
        let lhs = collect_streams(lhs_streams).await?;
        let rhs = collect_streams(rhs_streams).await?;
        let joined = binary::binary_join(
            lhs,
            rhs,
            self.op,
            self.cardinality,
            &self.on,
            &self.ignoring,
            &self.include,
        )?;
        Ok(QueryResult::new(
            schema,
            stream::iter(joined.into_iter().map(Ok)).boxed(),
        ))
    }
}

/// AND / OR / UNLESS over two sides
pub struct SetOperatorExec {
    pub lhs: Vec<Arc<dyn ExecPlan>>,
    pub rhs: Vec<Arc<dyn ExecPlan>>,
    pub op: BinaryOp,
    pub on: Vec<String>,
    pub ignoring: Vec<String>,
    pub transformers: Vec<RangeVectorTransformer>,
}

impl fmt::Debug for SetOperatorExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetOperatorExec").field("op", &self.op).finish()
    }
}

#[async_trait]
impl ExecPlan for SetOperatorExec {
    fn dispatcher(&self) -> PlanDispatcher {
        let all: Vec<Arc<dyn ExecPlan>> =
            self.lhs.iter().chain(&self.rhs).cloned().collect();
        pick_dispatcher(&all)
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        self.lhs.iter().chain(&self.rhs).cloned().collect()
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let (schema, lhs_streams) = execute_children(&self.lhs, store, session).await?;
        let (_, rhs_streams) = execute_children(&self.rhs, store, session).await?;
        let lhs = collect_streams(lhs_streams).await?;
        let rhs = collect_streams(rhs_streams).await?;
        let result = binary::set_operation(lhs, rhs, self.op, &self.on, &self.ignoring)?;
        Ok(QueryResult::new(
            schema,
            stream::iter(result.into_iter().map(Ok)).boxed(),
        ))
    }
}

/// Scalar-vector arithmetic: the scalar side produces one per-step series
pub struct ScalarVectorBinaryExec {
    pub scalar: Arc<dyn ExecPlan>,
    pub vector: Arc<dyn ExecPlan>,
    pub op: BinaryOp,
    pub scalar_is_lhs: bool,
    pub transformers: Vec<RangeVectorTransformer>,
}

impl fmt::Debug for ScalarVectorBinaryExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarVectorBinaryExec")
            .field("op", &self.op)
            .finish()
    }
}

#[async_trait]
impl ExecPlan for ScalarVectorBinaryExec {
    fn dispatcher(&self) -> PlanDispatcher {
        self.vector.dispatcher()
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![self.scalar.clone(), self.vector.clone()]
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        use futures::TryStreamExt;
        let scalar_result = self.scalar.execute(store.clone(), session.clone()).await?;
        let scalars: Vec<RangeVector> = scalar_result.stream.try_collect().await?;
        let by_ts: std::collections::BTreeMap<i64, f64> = match scalars.first() {
            Some(rv) => rv
                .double_samples()?
                .iter()
                .map(|s| (s.ts, s.value))
                .collect(),
            None => std::collections::BTreeMap::new(),
        };

        let vector_result = self.vector.execute(store.clone(), session.clone()).await?;
        let op = self.op;
        let scalar_is_lhs = self.scalar_is_lhs;
        let mapped = super::transformers::map_stream(vector_result.stream, move |rv| {
            let samples = rv
                .double_samples()?
                .iter()
                .map(|s| {
                    let scalar = by_ts.get(&s.ts).copied().unwrap_or(f64::NAN);
                    let value = if scalar_is_lhs {
                        op.apply(scalar, s.value)
                    } else {
                        op.apply(s.value, scalar)
                    };
                    Sample::new(s.ts, value)
                })
                .collect();
            // arithmetic with a scalar drops the metric name
            let key: RangeVectorKey = rv
                .key
                .iter()
                .filter(|(name, _)| name.as_str() != "__name__")
                .map(|(n, v)| (n.clone(), v.clone()))
                .collect();
            Ok(RangeVector::doubles(key, samples))
        });
        Ok(QueryResult::new(vector_result.schema, mapped))
    }
}

/// Scalar generators over the step grid
#[derive(Debug, Clone, Copy)]
pub enum ScalarSource {
    Fixed(f64),
    Time(ScalarTimeFunction),
}

/// Emits a single key-less vector carrying the scalar per step
#[derive(Debug)]
pub struct GenerateScalarExec {
    pub source: ScalarSource,
    pub start: i64,
    pub step: i64,
    pub end: i64,
    pub transformers: Vec<RangeVectorTransformer>,
}

#[async_trait]
impl ExecPlan for GenerateScalarExec {
    fn dispatcher(&self) -> PlanDispatcher {
        PlanDispatcher::InProcess
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        _store: &Arc<TimeSeriesMemStore>,
        _session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let source = self.source;
        let step = self.step.max(1);
        let samples: Vec<Sample> = (0..)
            .map(|i| self.start + i * step)
            .take_while(|t| *t <= self.end)
            .map(|t| {
                let value = match source {
                    ScalarSource::Fixed(v) => v,
                    ScalarSource::Time(f) => {
                        let secs = t as f64 / 1000.0;
                        match f {
                            ScalarTimeFunction::Time => secs,
                            ScalarTimeFunction::Hour => (secs / 3600.0) % 24.0,
                            ScalarTimeFunction::Minute => (secs / 60.0) % 60.0,
                            // epoch day zero was a Thursday
                            ScalarTimeFunction::DayOfWeek => {
                                ((secs / 86400.0).floor() + 4.0) % 7.0
                            }
                        }
                    }
                };
                Sample::new(t, value)
            })
            .collect();
        Ok(QueryResult::new(
            ResultSchema::time_series("value"),
            stream::once(futures::future::ready(Ok(RangeVector::doubles(
                RangeVectorKey::new(),
                samples,
            ))))
            .boxed(),
        ))
    }
}

/// `scalar(vector)`: the single series' value per timestamp, NaN otherwise
pub struct ScalarVaryingExec {
    pub child: Arc<dyn ExecPlan>,
    pub transformers: Vec<RangeVectorTransformer>,
}

impl fmt::Debug for ScalarVaryingExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarVaryingExec").finish()
    }
}

#[async_trait]
impl ExecPlan for ScalarVaryingExec {
    fn dispatcher(&self) -> PlanDispatcher {
        self.child.dispatcher()
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![self.child.clone()]
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        use futures::TryStreamExt;
        let result = self.child.execute(store.clone(), session.clone()).await?;
        let vectors: Vec<RangeVector> = result.stream.try_collect().await?;
        // (count of series, value) per timestamp
        let mut by_ts: std::collections::BTreeMap<i64, (usize, f64)> =
            std::collections::BTreeMap::new();
        for rv in &vectors {
            for s in rv.double_samples()? {
                if s.value.is_nan() {
                    continue;
                }
                let e = by_ts.entry(s.ts).or_insert((0, f64::NAN));
                e.0 += 1;
                e.1 = s.value;
            }
        }
        let samples: Vec<Sample> = by_ts
            .into_iter()
            .map(|(ts, (count, value))| {
                Sample::new(ts, if count == 1 { value } else { f64::NAN })
            })
            .collect();
        Ok(QueryResult::new(
            ResultSchema::time_series("value"),
            stream::once(futures::future::ready(Ok(RangeVector::doubles(
                RangeVectorKey::new(),
                samples,
            ))))
            .boxed(),
        ))
    }
}

/// Metadata leaf: distinct values of one label on one shard
#[derive(Debug)]
pub struct LabelValuesExec {
    pub dataset: DatasetRef,
    pub shard: u32,
    pub label: String,
    pub filters: Vec<ColumnFilter>,
    pub transformers: Vec<RangeVectorTransformer>,
}

#[async_trait]
impl ExecPlan for LabelValuesExec {
    fn dispatcher(&self) -> PlanDispatcher {
        PlanDispatcher::Shard(self.shard)
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        _session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let ts_shard = store.shard(&self.dataset, self.shard)?;
        let values: Vec<String> = if self.filters.is_empty() {
            ts_shard.index_snapshot().label_values(&self.label)
        } else {
            let mut values: Vec<String> = ts_shard
                .part_keys_matching(&self.filters)
                .into_iter()
                .filter_map(|k| PartitionKey::from_bytes(k).labels().ok())
                .filter_map(|labels| labels.get(&self.label).cloned())
                .collect();
            values.sort();
            values.dedup();
            values
        };
        let label = self.label.clone();
        let vectors = values.into_iter().map(move |v| {
            let mut key = RangeVectorKey::new();
            key.insert(label.clone(), v);
            Ok(RangeVector::doubles(key, Vec::new()))
        });
        Ok(QueryResult::new(
            ResultSchema::labels_only(),
            stream::iter(vectors).boxed(),
        ))
    }
}

/// Metadata leaf: series keys matching filters on one shard
#[derive(Debug)]
pub struct PartKeysExec {
    pub dataset: DatasetRef,
    pub shard: u32,
    pub filters: Vec<ColumnFilter>,
    pub transformers: Vec<RangeVectorTransformer>,
}

#[async_trait]
impl ExecPlan for PartKeysExec {
    fn dispatcher(&self) -> PlanDispatcher {
        PlanDispatcher::Shard(self.shard)
    }

    fn transformers(&self) -> &[RangeVectorTransformer] {
        &self.transformers
    }

    async fn execute_impl(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        _session: &Arc<QuerySession>,
    ) -> Result<QueryResult> {
        let ts_shard = store.shard(&self.dataset, self.shard)?;
        let vectors: Vec<Result<RangeVector>> = ts_shard
            .part_keys_matching(&self.filters)
            .into_iter()
            .map(|k| {
                let labels = PartitionKey::from_bytes(k).labels()?;
                Ok(RangeVector::doubles(labels, Vec::new()))
            })
            .collect();
        Ok(QueryResult::new(
            ResultSchema::labels_only(),
            stream::iter(vectors).boxed(),
        ))
    }
}
