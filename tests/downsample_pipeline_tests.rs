//! Downsample pipeline tests against the in-memory column store

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tephra::chunk::ChunkSetReader;
use tephra::downsample::DownsamplePipeline;
use tephra::prelude::*;
use tephra::schema::{DownsamplerKind, DownsamplerSpec, Labels, RecordBuilder};
use tephra::store::{ChunkScanMethod, ChunkSource, PartitionScanMethod, RawPartData};

const NUM_SHARDS: u32 = 2;

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

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.downsampler.resolutions = vec![Duration::from_secs(60)];
    settings.downsampler.ttls = vec![Duration::from_secs(86400)];
    settings.downsampler.raw_schema_names = vec!["prom-gauge".into(), "prom-counter".into()];
    settings.downsampler.user_time_override = Some(1_700_000_000_000);
    settings
}

async fn ingest_and_flush(
    mem: &TimeSeriesMemStore,
    dataset: &Dataset,
    series: &Labels,
    samples: &[(i64, f64)],
) {
    let key = PartitionKey::from_labels(series);
    let shard = key.shard(NUM_SHARDS);
    let mut builder = RecordBuilder::new(dataset.schema.clone());
    for &(ts, v) in samples {
        builder.add_sample(&key, ts, v).unwrap();
    }
    mem.ingest(&dataset.dataset_ref(), shard, &builder.build())
        .await
        .unwrap();
    let ts_shard = mem.shard(&dataset.dataset_ref(), shard).unwrap();
    for group in 0..mem.settings().memstore.groups_per_shard {
        ts_shard.flush_group(group).await.unwrap();
    }
}

async fn read_output_partitions(
    store: &InMemoryColumnStore,
    output: &Dataset,
    num_shards: u32,
) -> Vec<RawPartData> {
    let mut parts = Vec::new();
    for shard in 0..num_shards {
        let mut stream = store
            .read_raw_partitions(
                &output.dataset_ref(),
                0,
                PartitionScanMethod::AllShard(shard),
                ChunkScanMethod::All,
            )
            .await
            .unwrap();
        while let Some(part) = stream.next().await {
            parts.push(part.unwrap());
        }
    }
    parts.sort_by(|a, b| a.part_key.cmp(&b.part_key));
    parts
}

#[tokio::test]
async fn sum_downsampler_one_minute() {
    let dataset = gauge_dataset();
    let settings = settings();
    let store = Arc::new(InMemoryColumnStore::new());
    let mem = Arc::new(TimeSeriesMemStore::new(settings.clone(), store.clone()));
    for shard in 0..NUM_SHARDS {
        mem.setup(&dataset, NUM_SHARDS, shard).await.unwrap();
    }

    // doubles 1..=60 at 1s spacing, not boundary-aligned
    let t0 = 1_600_000_001_000i64;
    let series: Labels = [("__name__".to_string(), "latency_sum".to_string())]
        .into_iter()
        .collect();
    let samples: Vec<(i64, f64)> = (0..60).map(|i| (t0 + i * 1_000, (i + 1) as f64)).collect();
    ingest_and_flush(&mem, &dataset, &series, &samples).await;

    let pipeline = DownsamplePipeline::new(
        settings.downsampler.clone(),
        store.clone(),
        mem.clock().clone(),
    )
    .unwrap();
    pipeline.initialize(&dataset, NUM_SHARDS).await.unwrap();
    let summary = pipeline
        .run_window(&dataset, NUM_SHARDS, 0, i64::MAX / 4)
        .await
        .unwrap();
    assert_eq!(summary.source_partitions, 1);
    assert_eq!(summary.output_chunk_sets, 1);

    let output = DownsamplePipeline::output_dataset(&dataset, Duration::from_secs(60)).unwrap();
    let parts = read_output_partitions(&store, &output, NUM_SHARDS).await;
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].chunk_sets.len(), 1);

    let chunk_set = tephra::store::chunk_set_from_raw(&parts[0].chunk_sets[0]).unwrap();
    let reader = ChunkSetReader::new(Arc::new(chunk_set), output.schema.clone());
    let timestamps = reader.timestamps().unwrap();
    assert_eq!(timestamps.num_rows(), 1, "single 60s period");
    assert_eq!(timestamps.apply(0), t0 + 59_000);

    let col = |name: &str| {
        let id = output.schema.column_by_name(name).unwrap().id;
        reader.doubles(id).unwrap().apply(0)
    };
    assert_eq!(col("sum"), 1830.0);
    assert_eq!(col("min"), 1.0);
    assert_eq!(col("max"), 60.0);
    assert_eq!(col("count"), 60.0);
    assert_eq!(col("avg"), 30.5);
}

#[tokio::test]
async fn downsample_is_idempotent() {
    let dataset = gauge_dataset();
    let settings = settings();
    let store = Arc::new(InMemoryColumnStore::new());
    let mem = Arc::new(TimeSeriesMemStore::new(settings.clone(), store.clone()));
    for shard in 0..NUM_SHARDS {
        mem.setup(&dataset, NUM_SHARDS, shard).await.unwrap();
    }

    let t0 = 1_600_000_001_000i64;
    let series: Labels = [("__name__".to_string(), "idem".to_string())]
        .into_iter()
        .collect();
    let samples: Vec<(i64, f64)> = (0..300).map(|i| (t0 + i * 1_000, (i % 17) as f64)).collect();
    ingest_and_flush(&mem, &dataset, &series, &samples).await;

    let pipeline = DownsamplePipeline::new(
        settings.downsampler.clone(),
        store.clone(),
        mem.clock().clone(),
    )
    .unwrap();
    pipeline.initialize(&dataset, NUM_SHARDS).await.unwrap();
    let output = DownsamplePipeline::output_dataset(&dataset, Duration::from_secs(60)).unwrap();

    pipeline
        .run_window(&dataset, NUM_SHARDS, 0, i64::MAX / 4)
        .await
        .unwrap();
    let first: Vec<_> = read_output_partitions(&store, &output, NUM_SHARDS)
        .await
        .into_iter()
        .flat_map(|p| p.chunk_sets.into_iter().map(|c| (c.info, c.columns)))
        .collect();

    pipeline
        .run_window(&dataset, NUM_SHARDS, 0, i64::MAX / 4)
        .await
        .unwrap();
    let second: Vec<_> = read_output_partitions(&store, &output, NUM_SHARDS)
        .await
        .into_iter()
        .flat_map(|p| p.chunk_sets.into_iter().map(|c| (c.info, c.columns)))
        .collect();

    assert!(!first.is_empty());
    assert_eq!(first.len(), second.len());
    for ((info_a, cols_a), (info_b, cols_b)) in first.iter().zip(&second) {
        assert_eq!(info_a, info_b, "chunk info must be byte-stable");
        assert_eq!(cols_a, cols_b, "output chunks must be byte-identical");
    }
}

#[tokio::test]
async fn counter_downsample_emits_chunk_start_boundary() {
    let dataset = Dataset::new("prometheus", Schema::prom_counter()).with_downsamplers(vec![
        DownsamplerSpec::new(DownsamplerKind::Timestamp, vec![]),
        DownsamplerSpec::new(DownsamplerKind::LastValue, vec![1]),
    ]);
    let settings = settings();
    let store = Arc::new(InMemoryColumnStore::new());
    let mem = Arc::new(TimeSeriesMemStore::new(settings.clone(), store.clone()));
    for shard in 0..NUM_SHARDS {
        mem.setup(&dataset, NUM_SHARDS, shard).await.unwrap();
    }

    // counter with a reset at sample 5 inside one 60s period
    let t0 = 1_600_000_001_000i64;
    let series: Labels = [("__name__".to_string(), "reqs".to_string())]
        .into_iter()
        .collect();
    let values = [1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 1.0, 2.0, 3.0, 4.0];
    let samples: Vec<(i64, f64)> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| (t0 + i as i64 * 1_000, v))
        .collect();
    ingest_and_flush(&mem, &dataset, &series, &samples).await;

    let pipeline = DownsamplePipeline::new(
        settings.downsampler.clone(),
        store.clone(),
        mem.clock().clone(),
    )
    .unwrap();
    pipeline.initialize(&dataset, NUM_SHARDS).await.unwrap();
    pipeline
        .run_window(&dataset, NUM_SHARDS, 0, i64::MAX / 4)
        .await
        .unwrap();

    let output = DownsamplePipeline::output_dataset(&dataset, Duration::from_secs(60)).unwrap();
    let parts = read_output_partitions(&store, &output, NUM_SHARDS).await;
    assert_eq!(parts.len(), 1);
    let chunk_set = tephra::store::chunk_set_from_raw(&parts[0].chunk_sets[0]).unwrap();
    let reader = ChunkSetReader::new(Arc::new(chunk_set), output.schema.clone());
    let timestamps = reader.timestamps().unwrap();
    let last_id = output.schema.column_by_name("last").unwrap().id;
    let lasts = reader.doubles(last_id).unwrap();

    let rows: Vec<(i64, f64)> = (0..timestamps.num_rows())
        .map(|r| (timestamps.apply(r), lasts.apply(r)))
        .collect();
    // chunk start, pre-reset row, reset row, and the period end all survive
    assert!(rows.contains(&(t0, 1.0)), "chunk start boundary: {rows:?}");
    assert!(rows.contains(&(t0 + 4_000, 5.0)), "pre-drop row: {rows:?}");
    assert!(rows.contains(&(t0 + 5_000, 0.0)), "drop row: {rows:?}");
    assert!(rows.contains(&(t0 + 9_000, 4.0)), "period end: {rows:?}");
}

#[tokio::test]
async fn schemas_not_configured_are_skipped() {
    let dataset = Dataset::new("other", Schema::prom_histogram()).with_downsamplers(vec![
        DownsamplerSpec::new(DownsamplerKind::Timestamp, vec![]),
        DownsamplerSpec::new(DownsamplerKind::HistogramSum, vec![1]),
    ]);
    let settings = settings(); // raw_schema_names lacks prom-histogram
    let store = Arc::new(InMemoryColumnStore::new());
    let mem = Arc::new(TimeSeriesMemStore::new(settings.clone(), store.clone()));
    mem.setup(&dataset, 1, 0).await.unwrap();

    let pipeline = DownsamplePipeline::new(
        settings.downsampler.clone(),
        store.clone(),
        mem.clock().clone(),
    )
    .unwrap();
    let summary = pipeline.run_window(&dataset, 1, 0, i64::MAX / 4).await.unwrap();
    assert_eq!(summary.source_chunks, 0);
}
