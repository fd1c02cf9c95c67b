//! Memstore lifecycle tests: flush visibility, retry, eviction with
//! on-demand paging, and index recovery from the remote store.

use std::sync::Arc;
use std::time::Duration;

use tephra::prelude::*;
use tephra::query::{LogicalPlan, QueryContext, QueryEngine};
use tephra::schema::{Labels, RecordBuilder};

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn small_settings() -> Settings {
    let mut settings = Settings::default();
    settings.memstore.groups_per_shard = 4;
    settings.store.flush_retry_backoff = Duration::from_millis(10);
    settings
}

async fn setup_single_shard(
    settings: Settings,
    dataset: &Dataset,
) -> (Arc<TimeSeriesMemStore>, Arc<InMemoryColumnStore>) {
    let store = Arc::new(InMemoryColumnStore::new());
    let mem = Arc::new(TimeSeriesMemStore::new(settings, store.clone()));
    mem.setup(dataset, 1, 0).await.unwrap();
    (mem, store)
}

async fn ingest_series(
    mem: &TimeSeriesMemStore,
    dataset: &Dataset,
    series: &Labels,
    samples: &[(i64, f64)],
) {
    let key = PartitionKey::from_labels(series);
    let mut builder = RecordBuilder::new(dataset.schema.clone());
    for &(ts, v) in samples {
        builder.add_sample(&key, ts, v).unwrap();
    }
    mem.ingest(&dataset.dataset_ref(), 0, &builder.build())
        .await
        .unwrap();
}

async fn flush_all(mem: &TimeSeriesMemStore, dataset: &Dataset) {
    let shard = mem.shard(&dataset.dataset_ref(), 0).unwrap();
    for group in 0..mem.settings().memstore.groups_per_shard {
        shard.flush_group(group).await.unwrap();
    }
}

async fn query_values(
    mem: &Arc<TimeSeriesMemStore>,
    dataset: &Dataset,
    name: &str,
    start: i64,
    end: i64,
) -> Vec<f64> {
    let engine = QueryEngine::new(mem.clone());
    let plan = LogicalPlan::PeriodicSeries {
        raw: Box::new(LogicalPlan::RawSeries {
            dataset: dataset.dataset_ref(),
            filters: vec![ColumnFilter::equals("__name__", name)],
            columns: vec![],
            start,
            end,
        }),
        start,
        step: 10_000,
        end,
    };
    let (_, vectors) = engine.run(&plan, &QueryContext::new("probe")).await.unwrap();
    vectors
        .first()
        .map(|v| {
            v.double_samples()
                .unwrap()
                .iter()
                .map(|s| s.value)
                .filter(|v| !v.is_nan())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn samples_visible_before_and_after_flush() {
    let dataset = Dataset::new("metrics", Schema::prom_gauge());
    let (mem, store) = setup_single_shard(small_settings(), &dataset).await;
    let start = 1_600_000_000_000i64;
    let series = labels(&[("__name__", "vis"), ("app", "x")]);
    let samples: Vec<(i64, f64)> = (0..10).map(|i| (start + i * 10_000, i as f64)).collect();
    ingest_series(&mem, &dataset, &series, &samples).await;

    // visible from the write buffers
    let before = query_values(&mem, &dataset, "vis", start, start + 90_000).await;
    assert_eq!(before.len(), 10);

    flush_all(&mem, &dataset).await;
    assert!(store.chunk_sets_written() >= 1, "flush persisted chunks");

    // still visible from sealed chunks
    let after = query_values(&mem, &dataset, "vis", start, start + 90_000).await;
    assert_eq!(after, before);

    let stats = mem.shard(&dataset.dataset_ref(), 0).unwrap().stats();
    assert!(stats.flushes_completed >= 1);
    assert_eq!(stats.samples_ingested, 10);
}

#[tokio::test]
async fn out_of_order_samples_are_dropped_and_counted() {
    let dataset = Dataset::new("metrics", Schema::prom_gauge());
    let (mem, _) = setup_single_shard(small_settings(), &dataset).await;
    let start = 1_600_000_000_000i64;
    let series = labels(&[("__name__", "ooo")]);
    let key = PartitionKey::from_labels(&series);

    let mut builder = RecordBuilder::new(dataset.schema.clone());
    builder.add_sample(&key, start, 1.0).unwrap();
    builder.add_sample(&key, start + 10_000, 2.0).unwrap();
    builder.add_sample(&key, start + 5_000, 99.0).unwrap(); // out of order
    builder.add_sample(&key, start + 20_000, 3.0).unwrap();
    let stats = mem
        .ingest(&dataset.dataset_ref(), 0, &builder.build())
        .await
        .unwrap();
    assert_eq!(stats.rows_ingested, 3);
    assert_eq!(stats.out_of_order_dropped, 1);

    let values = query_values(&mem, &dataset, "ooo", start, start + 20_000).await;
    assert_eq!(values, vec![1.0, 2.0, 3.0]);
    let shard_stats = mem.shard(&dataset.dataset_ref(), 0).unwrap().stats();
    assert_eq!(shard_stats.out_of_order_dropped, 1);
}

#[tokio::test]
async fn flush_retries_transient_remote_failures() {
    let dataset = Dataset::new("metrics", Schema::prom_gauge());
    let (mem, store) = setup_single_shard(small_settings(), &dataset).await;
    let start = 1_600_000_000_000i64;
    let series = labels(&[("__name__", "retry")]);
    ingest_series(&mem, &dataset, &series, &[(start, 1.0), (start + 10_000, 2.0)]).await;

    store.fail_next_writes(2);
    flush_all(&mem, &dataset).await;

    assert!(store.chunk_sets_written() >= 1, "write succeeded after retries");
    assert!(store.write_calls() >= 3, "two failures plus one success");
    let stats = mem.shard(&dataset.dataset_ref(), 0).unwrap().stats();
    assert_eq!(stats.flush_failures, 0, "transient failures are not terminal");
}

#[tokio::test]
async fn eviction_then_on_demand_paging() {
    let dataset = Dataset::new("metrics", Schema::prom_gauge());
    let mut settings = small_settings();
    settings.memstore.max_num_partitions = 1;
    let (mem, _) = setup_single_shard(settings, &dataset).await;
    let start = 1_600_000_000_000i64;

    let cold = labels(&[("__name__", "cold"), ("app", "a")]);
    let samples_a: Vec<(i64, f64)> = (0..5).map(|i| (start + i * 10_000, i as f64)).collect();
    ingest_series(&mem, &dataset, &cold, &samples_a).await;
    flush_all(&mem, &dataset).await;

    // a second partition pushes the shard over its partition budget; the
    // flushed cold partition is evicted to a stub
    let hot = labels(&[("__name__", "hot"), ("app", "b")]);
    let samples_b: Vec<(i64, f64)> = (0..5).map(|i| (start + i * 10_000, i as f64)).collect();
    ingest_series(&mem, &dataset, &hot, &samples_b).await;

    let shard = mem.shard(&dataset.dataset_ref(), 0).unwrap();
    assert!(shard.stats().partitions_evicted >= 1, "cold partition evicted");

    // querying the evicted series pages its chunks back from the store
    let values = query_values(&mem, &dataset, "cold", start, start + 40_000).await;
    assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    assert!(shard.stats().odp_reads >= 1, "read went through demand paging");
}

#[tokio::test]
async fn index_recovery_rebuilds_from_part_keys() {
    let dataset = Dataset::new("metrics", Schema::prom_gauge());
    let (mem, store) = setup_single_shard(small_settings(), &dataset).await;
    let start = 1_600_000_000_000i64;

    for i in 0..3 {
        let series = labels(&[("__name__", "persisted"), ("inst", &format!("i-{i}"))]);
        let samples: Vec<(i64, f64)> = (0..4).map(|j| (start + j * 10_000, (i * 10 + j) as f64)).collect();
        ingest_series(&mem, &dataset, &series, &samples).await;
    }
    flush_all(&mem, &dataset).await;
    drop(mem);

    // a fresh node over the same remote store rebuilds its index
    let mem2 = Arc::new(TimeSeriesMemStore::new(small_settings(), store.clone()));
    mem2.setup(&dataset, 1, 0).await.unwrap();
    let shard = mem2.shard(&dataset.dataset_ref(), 0).unwrap();
    let recovered = shard.recover_index().await.unwrap();
    assert_eq!(recovered, 3);
    assert_eq!(shard.index_snapshot().label_values("inst").len(), 3);

    // recovered stubs page data in on first read
    let values = query_values(&mem2, &dataset, "persisted", start, start + 30_000).await;
    assert_eq!(values.len(), 4);
}

#[tokio::test]
async fn ingest_stream_is_cancellable() {
    let dataset = Dataset::new("metrics", Schema::prom_gauge());
    let (mem, _) = setup_single_shard(small_settings(), &dataset).await;
    let start = 1_600_000_000_000i64;

    let series = labels(&[("__name__", "streamed")]);
    let key = PartitionKey::from_labels(&series);
    let mut builder = RecordBuilder::new(dataset.schema.clone());
    builder.add_sample(&key, start, 1.0).unwrap();
    let container = builder.build();

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let stream = futures::StreamExt::boxed(tokio_stream_from(rx));
    let handle = mem
        .ingest_stream(&dataset.dataset_ref(), 0, stream, Box::new(|_| {}))
        .unwrap();

    tx.send(container).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let values = query_values(&mem, &dataset, "streamed", start, start).await;
    assert_eq!(values, vec![1.0]);

    handle.cancel();
    handle.join().await;
}

fn tokio_stream_from(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<tephra::schema::RecordContainer>,
) -> impl futures::Stream<Item = tephra::schema::RecordContainer> {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
}
