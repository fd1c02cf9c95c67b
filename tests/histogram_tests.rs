//! Histogram ingestion and query tests

use std::sync::Arc;

use tephra::prelude::*;
use tephra::query::{
    InstantFunction, LogicalPlan, MiscFunction, QueryContext, RangeVector,
};
use tephra::schema::{FieldValue, HistogramValue, Labels, RecordBuilder};

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn setup(dataset: &Dataset) -> Arc<TimeSeriesMemStore> {
    let store = Arc::new(InMemoryColumnStore::new());
    let mem = Arc::new(TimeSeriesMemStore::new(Settings::default(), store));
    mem.setup(dataset, 1, 0).await.unwrap();
    mem
}

fn hist(bounds: &Arc<Vec<f64>>, counts: &[f64]) -> HistogramValue {
    HistogramValue::new(bounds.clone(), counts.to_vec())
}

fn find_bucket<'a>(vectors: &'a [RangeVector], le: &str) -> &'a RangeVector {
    vectors
        .iter()
        .find(|v| v.key.get("le").map(String::as_str) == Some(le))
        .unwrap_or_else(|| panic!("no series with le={le}"))
}

#[tokio::test]
async fn hist_to_prom_vectors_pads_scheme_change() {
    let dataset = Dataset::new("metrics", Schema::prom_histogram());
    let mem = setup(&dataset).await;
    let start = 1_600_000_000_000i64;

    let series = labels(&[("__name__", "request_latency"), ("app", "x")]);
    let key = PartitionKey::from_labels(&series);
    let scheme_a = Arc::new(vec![10.0, 100.0, f64::INFINITY]);
    let scheme_b = Arc::new(vec![10.0, 50.0, 100.0, f64::INFINITY]);

    let mut builder = RecordBuilder::new(dataset.schema.clone());
    builder
        .add_record(&key, start, &[FieldValue::Histogram(hist(&scheme_a, &[1.0, 3.0, 4.0]))])
        .unwrap();
    builder
        .add_record(
            &key,
            start + 60_000,
            &[FieldValue::Histogram(hist(&scheme_b, &[2.0, 3.0, 5.0, 6.0]))],
        )
        .unwrap();
    builder
        .add_record(
            &key,
            start + 120_000,
            &[FieldValue::Histogram(hist(&scheme_b, &[3.0, 5.0, 8.0, 9.0]))],
        )
        .unwrap();
    mem.ingest(&dataset.dataset_ref(), 0, &builder.build())
        .await
        .unwrap();

    let engine = QueryEngine::new(mem);
    let plan = LogicalPlan::ApplyMiscellaneousFunction {
        inner: Box::new(LogicalPlan::PeriodicSeries {
            raw: Box::new(LogicalPlan::RawSeries {
                dataset: dataset.dataset_ref(),
                filters: vec![ColumnFilter::equals("__name__", "request_latency")],
                columns: vec![],
                start,
                end: start + 120_000,
            }),
            start,
            step: 60_000,
            end: start + 120_000,
        }),
        function: MiscFunction::HistToPromVectors,
    };
    let (schema, vectors) = engine.run(&plan, &QueryContext::new("hist")).await.unwrap();
    assert!(schema.is_histogram_double);
    assert_eq!(vectors.len(), 4, "le in {{10, 50, 100, +Inf}}");

    for rv in &vectors {
        assert_eq!(rv.key.get("__name__").unwrap(), "request_latency_bucket");
        assert_eq!(rv.num_samples(), 3);
    }
    let le50 = find_bucket(&vectors, "50");
    let samples = le50.double_samples().unwrap();
    assert!(samples[0].value.is_nan(), "first scheme has no le=50 bucket");
    assert_eq!(samples[1].value, 3.0);
    assert_eq!(samples[2].value, 5.0);

    let le_inf = find_bucket(&vectors, "+Inf");
    let totals: Vec<f64> = le_inf.double_samples().unwrap().iter().map(|s| s.value).collect();
    assert_eq!(totals, vec![4.0, 6.0, 9.0]);
}

#[tokio::test]
async fn histogram_quantile_over_prom_buckets() {
    let dataset = Dataset::new("metrics", Schema::prom_gauge());
    let mem = setup(&dataset).await;
    let start = 1_600_000_000_000i64;

    // cumulative bucket counts: 10 <= 1s, 30 <= 2s, 30 total
    let buckets = [("1", 10.0), ("2", 30.0), ("+Inf", 30.0)];
    let mut builder = RecordBuilder::new(dataset.schema.clone());
    for (le, count) in buckets {
        let series = labels(&[("__name__", "latency_bucket"), ("job", "api"), ("le", le)]);
        let key = PartitionKey::from_labels(&series);
        builder.add_sample(&key, start, count).unwrap();
    }
    mem.ingest(&dataset.dataset_ref(), 0, &builder.build())
        .await
        .unwrap();

    let engine = QueryEngine::new(mem);
    let plan = LogicalPlan::ApplyInstantFunction {
        inner: Box::new(LogicalPlan::PeriodicSeries {
            raw: Box::new(LogicalPlan::RawSeries {
                dataset: dataset.dataset_ref(),
                filters: vec![ColumnFilter::equals("__name__", "latency_bucket")],
                columns: vec![],
                start,
                end: start,
            }),
            start,
            step: 60_000,
            end: start,
        }),
        function: InstantFunction::HistogramQuantile(0.5),
    };
    let (_, vectors) = engine.run(&plan, &QueryContext::new("hq")).await.unwrap();

    assert_eq!(vectors.len(), 1);
    assert_eq!(vectors[0].key, labels(&[("job", "api")]));
    let median = vectors[0].double_samples().unwrap()[0].value;
    // rank 15 interpolates inside the (1, 2] bucket
    assert!((median - 1.25).abs() < 1e-9, "median was {median}");
}

#[tokio::test]
async fn histogram_scheme_change_survives_flush() {
    let dataset = Dataset::new("metrics", Schema::prom_histogram());
    let mem = setup(&dataset).await;
    let start = 1_600_000_000_000i64;

    let series = labels(&[("__name__", "h"), ("app", "x")]);
    let key = PartitionKey::from_labels(&series);
    let scheme_a = Arc::new(vec![10.0, f64::INFINITY]);
    let scheme_b = Arc::new(vec![10.0, 50.0, f64::INFINITY]);

    let mut builder = RecordBuilder::new(dataset.schema.clone());
    builder
        .add_record(&key, start, &[FieldValue::Histogram(hist(&scheme_a, &[1.0, 2.0]))])
        .unwrap();
    builder
        .add_record(
            &key,
            start + 1_000,
            &[FieldValue::Histogram(hist(&scheme_b, &[1.0, 2.0, 3.0]))],
        )
        .unwrap();
    mem.ingest(&dataset.dataset_ref(), 0, &builder.build())
        .await
        .unwrap();

    let shard = mem.shard(&dataset.dataset_ref(), 0).unwrap();
    for group in 0..mem.settings().memstore.groups_per_shard {
        shard.flush_group(group).await.unwrap();
    }

    let engine = QueryEngine::new(mem);
    let plan = LogicalPlan::PeriodicSeries {
        raw: Box::new(LogicalPlan::RawSeries {
            dataset: dataset.dataset_ref(),
            filters: vec![ColumnFilter::equals("__name__", "h")],
            columns: vec![],
            start,
            end: start + 1_000,
        }),
        start,
        step: 1_000,
        end: start + 1_000,
    };
    let (_, vectors) = engine.run(&plan, &QueryContext::new("schemes")).await.unwrap();
    assert_eq!(vectors.len(), 1);
    match &vectors[0].data {
        tephra::query::SeriesData::Histograms(samples) => {
            assert_eq!(samples.len(), 2);
            assert_eq!(samples[0].value.num_buckets(), 2);
            assert_eq!(samples[1].value.num_buckets(), 3);
        }
        other => panic!("expected histogram rows, got {other:?}"),
    }
}
