//! Ingest path benchmarks: chunk codecs, record containers, shard ingest

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

use tephra::chunk::{DoubleEncoder, DoubleReader, TimestampEncoder, TimestampReader};
use tephra::config::Settings;
use tephra::memstore::TimeSeriesMemStore;
use tephra::schema::{Dataset, Labels, PartitionKey, RecordBuilder, Schema};
use tephra::store::InMemoryColumnStore;

const ROWS: usize = 10_000;

fn bench_chunk_encode(c: &mut Criterion) {
    let timestamps: Vec<i64> = (0..ROWS as i64).map(|i| 1_600_000_000_000 + i * 10_000).collect();
    let values: Vec<f64> = (0..ROWS).map(|i| (i as f64 * 0.01).sin() * 100.0).collect();

    let mut group = c.benchmark_group("chunk_encode");
    group.throughput(Throughput::Elements(ROWS as u64));
    group.bench_function("timestamp_delta_rle", |b| {
        b.iter(|| {
            let mut enc = TimestampEncoder::new();
            for &ts in &timestamps {
                enc.append(ts);
            }
            black_box(enc.encode())
        })
    });
    group.bench_function("double_xor", |b| {
        b.iter(|| {
            let mut enc = DoubleEncoder::new();
            for &v in &values {
                enc.append(v);
            }
            black_box(enc.encode())
        })
    });
    group.finish();
}

fn bench_chunk_decode(c: &mut Criterion) {
    let mut ts_enc = TimestampEncoder::new();
    let mut v_enc = DoubleEncoder::new();
    for i in 0..ROWS as i64 {
        ts_enc.append(1_600_000_000_000 + i * 10_000);
        v_enc.append((i as f64 * 0.01).cos());
    }
    let ts_bytes = ts_enc.encode();
    let v_bytes = v_enc.encode();

    let mut group = c.benchmark_group("chunk_decode");
    group.throughput(Throughput::Elements(ROWS as u64));
    group.bench_function("timestamp_reader", |b| {
        b.iter(|| black_box(TimestampReader::new(&ts_bytes).unwrap().num_rows()))
    });
    group.bench_function("double_reader_sum", |b| {
        b.iter(|| {
            let reader = DoubleReader::new(&v_bytes).unwrap();
            black_box(reader.sum(0, ROWS - 1))
        })
    });
    group.finish();
}

fn bench_shard_ingest(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dataset = Dataset::new("bench", Schema::prom_gauge());
    let store = Arc::new(InMemoryColumnStore::new());
    let mem = Arc::new(TimeSeriesMemStore::new(Settings::default(), store));
    rt.block_on(mem.setup(&dataset, 1, 0)).unwrap();

    let mut labels = Labels::new();
    labels.insert("__name__".into(), "bench_metric".into());
    labels.insert("host".into(), "server-01".into());
    let key = PartitionKey::from_labels(&labels);

    let mut next_ts = 1_600_000_000_000i64;
    let mut group = c.benchmark_group("shard_ingest");
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("containers_1k_rows", |b| {
        b.iter(|| {
            let mut builder = RecordBuilder::new(dataset.schema.clone());
            for _ in 0..1_000 {
                builder.add_sample(&key, next_ts, 1.0).unwrap();
                next_ts += 1;
            }
            let container = builder.build();
            let stats = rt
                .block_on(mem.ingest(&dataset.dataset_ref(), 0, &container))
                .unwrap();
            black_box(stats.rows_ingested)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_chunk_encode, bench_chunk_decode, bench_shard_ingest);
criterion_main!(benches);
