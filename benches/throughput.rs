use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use occmap::{Engine, TxnFlags};

const DATASET_SIZE: u64 = 10_000;

fn setup(engine: &Arc<Engine>) -> Arc<occmap::Table> {
    let table = engine.open_table("bench");
    for i in 0..DATASET_SIZE {
        let mut txn = engine.begin(TxnFlags::NONE);
        txn.put(&table, i.to_string().as_bytes(), b"payload").unwrap();
        txn.commit().unwrap();
    }
    table
}

fn bench_single_thread(c: &mut Criterion) {
    let engine = Arc::new(Engine::new());
    let table = setup(&engine);

    let mut group = c.benchmark_group("single_thread");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_commit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = (i % DATASET_SIZE).to_string();
            i += 1;
            let mut txn = engine.begin(TxnFlags::NONE);
            let v = txn.get(&table, key.as_bytes()).unwrap();
            txn.commit().unwrap();
            black_box(v)
        })
    });

    group.bench_function("put_commit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = (i % DATASET_SIZE).to_string();
            i += 1;
            let mut txn = engine.begin(TxnFlags::NONE);
            txn.put(&table, key.as_bytes(), b"payload").unwrap();
            txn.commit().unwrap();
        })
    });

    group.bench_function("scan_64", |b| {
        b.iter(|| {
            let mut txn = engine.begin(TxnFlags::LOW_LEVEL_SCAN);
            let mut n = 0u32;
            txn.scan(&table, b"5", None, |_, _| {
                n += 1;
                n < 64
            })
            .unwrap();
            txn.commit().unwrap();
            black_box(n)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_single_thread);
criterion_main!(benches);
