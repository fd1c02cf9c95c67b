//! Downsample pipeline
//!
//! A deterministic, idempotent batch job. Each run scans the source dataset's
//! ingestion-time index over a bounded window (widened by configured slack),
//! marks downsample periods per source chunk, applies the dataset's
//! downsamplers per period, and writes output chunks to one lower-resolution
//! dataset per configured `(resolution, ttl)` pair.

mod aggregators;
mod marker;

pub use aggregators::{downsample_period, DownsampledValue};
pub use marker::{counter_periods, default_periods};

use crate::chunk::{
    ChunkId, ChunkInfo, ChunkSet, ChunkSetReader, DoubleEncoder, HistogramEncoder,
    TimestampEncoder,
};
use crate::clock::IngestionClock;
use crate::config::DownsamplerConfig;
use crate::schema::{
    ColumnDef, ColumnType, Dataset, DownsamplerKind, PartitionKey, Schema,
};
use crate::store::{ChunkSetRecord, ColumnStoreRef, RawPartData};
use crate::{Error, Result};
use bytes::Bytes;
use futures::StreamExt;
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one downsample window
#[derive(Debug, Default, Clone, Copy)]
pub struct DownsampleSummary {
    pub source_partitions: usize,
    pub source_chunks: usize,
    pub output_chunk_sets: usize,
}

/// Periodic job downsampling one raw dataset into multiple resolutions
pub struct DownsamplePipeline {
    config: DownsamplerConfig,
    store: ColumnStoreRef,
    clock: Arc<IngestionClock>,
    /// Per-(source, resolution) output dataset handles. Bounded LRU; a miss
    /// re-derives the handle, which is idempotent.
    output_datasets: Cache<(String, u64), Arc<Dataset>>,
}

impl DownsamplePipeline {
    pub fn new(config: DownsamplerConfig, store: ColumnStoreRef, clock: Arc<IngestionClock>) -> Result<Self> {
        if config.resolutions.len() != config.ttls.len() {
            return Err(Error::Internal(format!(
                "downsampler config: {} resolutions but {} ttls",
                config.resolutions.len(),
                config.ttls.len()
            )));
        }
        Ok(Self {
            config,
            store,
            clock,
            output_datasets: Cache::new(256),
        })
    }

    /// Derive the output dataset for one source dataset and resolution.
    pub fn output_dataset(source: &Dataset, resolution: Duration) -> Result<Dataset> {
        let specs = &source.downsamplers;
        let ts_specs = specs
            .iter()
            .filter(|s| s.kind == DownsamplerKind::Timestamp)
            .count();
        if ts_specs != 1 {
            return Err(Error::SchemaMismatch(format!(
                "dataset {} needs exactly one timestamp downsampler, has {ts_specs}",
                source.name
            )));
        }
        let mut columns = vec![ColumnDef::new(0, "timestamp", ColumnType::Timestamp)];
        let mut id = 1u16;
        for spec in specs {
            if spec.kind == DownsamplerKind::Timestamp {
                continue;
            }
            let mut name = column_name(&spec.kind).to_string();
            if columns.iter().any(|c| c.name == name) {
                name = format!("{name}_{id}");
            }
            let mut col = ColumnDef::new(id, name, spec.kind.output_type());
            // downsampled counters stay counters for rate computability
            if spec.kind == DownsamplerKind::LastValue {
                if let Some(&input) = spec.inputs.first() {
                    if source
                        .schema
                        .column_by_id(input)
                        .map(|c| c.counter)
                        .unwrap_or(false)
                    {
                        col = col.counter();
                    }
                }
            }
            columns.push(col);
            id += 1;
        }
        let name = format!("{}_ds_{}", source.name, resolution.as_secs());
        Ok(Dataset::new(name.clone(), Arc::new(Schema::new(name, columns)?)))
    }

    fn cached_output_dataset(&self, source: &Dataset, resolution: Duration) -> Result<Arc<Dataset>> {
        let key = (source.name.clone(), resolution.as_secs());
        if let Some(hit) = self.output_datasets.get(&key) {
            return Ok(hit);
        }
        let derived = Arc::new(Self::output_dataset(source, resolution)?);
        self.output_datasets.insert(key, derived.clone());
        Ok(derived)
    }

    /// Create output dataset tables. Idempotent.
    pub async fn initialize(&self, source: &Dataset, num_shards: u32) -> Result<()> {
        for resolution in self.config.resolutions.clone() {
            let output = self.cached_output_dataset(source, resolution)?;
            self.store.initialize(&output.dataset_ref(), num_shards).await?;
        }
        Ok(())
    }

    /// Downsample every source chunk whose ingestion time falls inside
    /// `[ing_start, ing_end)`, widened by the configured slack.
    pub async fn run_window(
        &self,
        source: &Dataset,
        num_shards: u32,
        ing_start: i64,
        ing_end: i64,
    ) -> Result<DownsampleSummary> {
        if !self.config.raw_schema_names.contains(&source.schema.name) {
            debug!(dataset = %source.name, schema = %source.schema.name, "schema not configured for downsampling");
            return Ok(DownsampleSummary::default());
        }
        let widen = self.config.widen_ingestion_time_range_by.as_millis() as i64;
        let source_ref = source.dataset_ref();
        let splits = self.store.scan_splits(&source_ref, 1).await?;
        let mut batches = self
            .store
            .chunks_by_ingestion_time_range(
                &source_ref,
                splits,
                ing_start - widen,
                ing_end + widen,
                i64::MIN / 2,
                i64::MAX / 2,
                0,
                self.config.num_partitions_per_write,
            )
            .await?;

        let mut summary = DownsampleSummary::default();
        while let Some(batch) = batches.next().await {
            let batch = batch?;
            summary.source_partitions += batch.len();
            let written = self.downsample_batch(source, num_shards, &batch, &mut summary).await?;
            summary.output_chunk_sets += written;
        }
        info!(
            dataset = %source.name,
            partitions = summary.source_partitions,
            chunks = summary.source_chunks,
            outputs = summary.output_chunk_sets,
            "downsample window complete"
        );
        Ok(summary)
    }

    async fn downsample_batch(
        &self,
        source: &Dataset,
        num_shards: u32,
        batch: &[RawPartData],
        summary: &mut DownsampleSummary,
    ) -> Result<usize> {
        // (resolution index, part key) -> output rows
        let mut outputs: HashMap<(usize, Bytes), Vec<Vec<DownsampledValue>>> = HashMap::new();

        for part in batch {
            for raw_set in &part.chunk_sets {
                summary.source_chunks += 1;
                let chunk_set = crate::store::chunk_set_from_raw(raw_set)?;
                let reader = ChunkSetReader::new(Arc::new(chunk_set), source.schema.clone());
                for (res_ix, resolution) in self.config.resolutions.iter().enumerate() {
                    let rows = self.downsample_chunk(source, &reader, *resolution)?;
                    if !rows.is_empty() {
                        outputs
                            .entry((res_ix, part.part_key.clone()))
                            .or_default()
                            .extend(rows);
                    }
                }
            }
        }

        let ingestion_time = self
            .config
            .user_time_override
            .unwrap_or_else(|| self.clock.now_ms());

        let mut written = 0usize;
        for (res_ix, resolution) in self.config.resolutions.iter().enumerate() {
            let output = self.cached_output_dataset(source, *resolution)?;
            let output_ref = output.dataset_ref();
            let mut records = Vec::new();
            for ((ix, part_key), rows) in &outputs {
                if *ix != res_ix {
                    continue;
                }
                let chunk_set = encode_output(&output.schema, rows, ingestion_time)?;
                let shard = PartitionKey::from_bytes(part_key.clone()).shard(num_shards.max(1));
                records.push(ChunkSetRecord::from_chunk_set(
                    output_ref.clone(),
                    shard,
                    part_key.clone(),
                    &chunk_set,
                ));
            }
            if records.is_empty() {
                continue;
            }
            let count = records.len();
            let ttl = self.config.ttls[res_ix].as_secs();
            match self
                .store
                .write(&output_ref, futures::stream::iter(records).boxed(), ttl)
                .await
            {
                Ok(n) => written += n,
                Err(e) => {
                    warn!(output = %output_ref, error = %e, count, "downsample write failed");
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Mark periods for one source chunk and fold each through the dataset's
    /// downsamplers. Row order follows the source chunk.
    fn downsample_chunk(
        &self,
        source: &Dataset,
        reader: &ChunkSetReader,
        resolution: Duration,
    ) -> Result<Vec<Vec<DownsampledValue>>> {
        let resolution_ms = resolution.as_millis() as i64;
        let timestamps = reader.timestamps()?;

        // A counter column switches the whole chunk to the counter marker
        let counter_column = source.schema.data_columns().iter().find(|c| c.counter);
        let period_ends = match counter_column {
            Some(column) => {
                let doubles = reader.doubles(column.id)?;
                counter_periods(column, &timestamps, &doubles, resolution_ms)?
            }
            None => default_periods(&timestamps, resolution_ms),
        };

        let mut rows = Vec::with_capacity(period_ends.len());
        let mut start_row = 0usize;
        for &end_row in &period_ends {
            let row: Result<Vec<DownsampledValue>> = source
                .downsamplers
                .iter()
                .map(|spec| downsample_period(spec, reader, start_row, end_row))
                .collect();
            rows.push(row?);
            start_row = end_row + 1;
        }
        Ok(rows)
    }
}

fn column_name(kind: &DownsamplerKind) -> &'static str {
    match kind {
        DownsamplerKind::Min => "min",
        DownsamplerKind::Max => "max",
        DownsamplerKind::Sum => "sum",
        DownsamplerKind::Count => "count",
        DownsamplerKind::Avg | DownsamplerKind::AvgFromAvgCount | DownsamplerKind::AvgFromSumCount => {
            "avg"
        }
        DownsamplerKind::LastValue => "last",
        DownsamplerKind::HistogramSum => "hsum",
        DownsamplerKind::Timestamp => "timestamp",
    }
}

/// Encode accumulated output rows into one sealed chunk set.
fn encode_output(
    schema: &Arc<Schema>,
    rows: &[Vec<DownsampledValue>],
    ingestion_time: i64,
) -> Result<ChunkSet> {
    // Rows arrive per source chunk in time order; the timestamp is whichever
    // spec produced a Timestamp value.
    let mut indexed: Vec<(i64, &Vec<DownsampledValue>)> = rows
        .iter()
        .map(|row| {
            let ts = row
                .iter()
                .find_map(|v| match v {
                    DownsampledValue::Timestamp(t) => Some(*t),
                    _ => None,
                })
                .ok_or_else(|| Error::Internal("output row missing timestamp".into()))?;
            Ok((ts, row))
        })
        .collect::<Result<_>>()?;
    indexed.sort_by_key(|(ts, _)| *ts);
    indexed.dedup_by_key(|(ts, _)| *ts);

    let mut ts_enc = TimestampEncoder::new();
    let mut double_encs: Vec<DoubleEncoder> = Vec::new();
    let mut hist_encs: Vec<HistogramEncoder> = Vec::new();
    // column index -> encoder slot, preserving schema order
    let mut slots: Vec<(ColumnType, usize)> = Vec::new();
    for col in schema.data_columns() {
        match col.column_type {
            ColumnType::Double => {
                slots.push((ColumnType::Double, double_encs.len()));
                double_encs.push(DoubleEncoder::new());
            }
            ColumnType::Histogram => {
                slots.push((ColumnType::Histogram, hist_encs.len()));
                hist_encs.push(HistogramEncoder::new());
            }
            other => {
                return Err(Error::SchemaMismatch(format!(
                    "output column {} has type {other:?}",
                    col.name
                )))
            }
        }
    }

    for (ts, row) in &indexed {
        ts_enc.append(*ts);
        let mut slot_ix = 0usize;
        for value in row.iter() {
            match value {
                DownsampledValue::Timestamp(_) => continue,
                DownsampledValue::Double(v) => {
                    let (_, enc_ix) = slots[slot_ix];
                    double_encs[enc_ix].append(*v);
                    slot_ix += 1;
                }
                DownsampledValue::Histogram(h) => {
                    let (_, enc_ix) = slots[slot_ix];
                    hist_encs[enc_ix].append(h)?;
                    slot_ix += 1;
                }
            }
        }
    }

    let mut columns = vec![ts_enc.encode()];
    for (column_type, enc_ix) in &slots {
        columns.push(match column_type {
            ColumnType::Double => double_encs[*enc_ix].encode(),
            ColumnType::Histogram => hist_encs[*enc_ix].encode(),
            _ => unreachable!("slots carry value types only"),
        });
    }

    let start_time = indexed.first().map(|(ts, _)| *ts).unwrap_or(0);
    let end_time = indexed.last().map(|(ts, _)| *ts).unwrap_or(0);
    let info = ChunkInfo {
        id: ChunkId::new(start_time, 0),
        start_time,
        end_time,
        ingestion_time,
        num_rows: indexed.len() as u32,
    };
    Ok(ChunkSet::new(info, columns, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DownsamplerSpec;

    fn gauge_dataset() -> Dataset {
        Dataset::new("prometheus", Schema::prom_gauge()).with_downsamplers(vec![
            DownsamplerSpec::new(DownsamplerKind::Timestamp, vec![]),
            DownsamplerSpec::new(DownsamplerKind::Min, vec![1]),
            DownsamplerSpec::new(DownsamplerKind::Max, vec![1]),
            DownsamplerSpec::new(DownsamplerKind::Sum, vec![1]),
            DownsamplerSpec::new(DownsamplerKind::Count, vec![1]),
            DownsamplerSpec::new(DownsamplerKind::Avg, vec![1]),
        ])
    }

    #[test]
    fn output_dataset_schema_derivation() {
        let output =
            DownsamplePipeline::output_dataset(&gauge_dataset(), Duration::from_secs(60)).unwrap();
        assert_eq!(output.name, "prometheus_ds_60");
        let names: Vec<&str> = output.schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["timestamp", "min", "max", "sum", "count", "avg"]);
    }

    #[test]
    fn output_dataset_requires_timestamp_spec() {
        let dataset = Dataset::new("x", Schema::prom_gauge())
            .with_downsamplers(vec![DownsamplerSpec::new(DownsamplerKind::Sum, vec![1])]);
        assert!(DownsamplePipeline::output_dataset(&dataset, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn downsampled_counter_keeps_counter_flag() {
        let dataset = Dataset::new("c", Schema::prom_counter()).with_downsamplers(vec![
            DownsamplerSpec::new(DownsamplerKind::Timestamp, vec![]),
            DownsamplerSpec::new(DownsamplerKind::LastValue, vec![1]),
        ]);
        let output =
            DownsamplePipeline::output_dataset(&dataset, Duration::from_secs(60)).unwrap();
        assert!(output.schema.column_by_name("last").unwrap().counter);
    }
}
