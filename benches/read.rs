use criterion::{black_box, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use vanilla_chronicle::{SourceRecord, Store, StoreConfig};

const RECORDS: u64 = 100_000;

fn bench_tail(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(
        dir.path().join("bench_store"),
        StoreConfig {
            segment_size_bytes: 16 * 1024 * 1024,
            entries_per_segment: 1 << 18,
            ..StoreConfig::default()
        },
    )
    .expect("store");
    let mut appender = store.create_appender().expect("appender");
    let mut record = SourceRecord {
        source_id: 3,
        seq: 0,
        value: 0x0bad_cafe_dead_beef,
        label: "FooBar".to_string(),
        detail: "AnotherFooBar".to_string(),
    };
    for seq in 0..RECORDS {
        record.seq = seq;
        record.append_to(&mut appender).expect("append");
    }

    let mut group = c.benchmark_group("tail");
    group.bench_function("advance_and_decode", |b| {
        b.iter(|| {
            let mut tailer = store.create_tailer();
            let mut total = 0u64;
            while tailer.advance().expect("advance") {
                let _id = tailer.read_i32().expect("id");
                total += tailer.read_varint().expect("seq");
                black_box(tailer.read_i64().expect("value"));
                black_box(tailer.read_str().expect("label").len());
                black_box(tailer.read_str().expect("detail").len());
            }
            black_box(total)
        });
    });
    group.bench_function("seek_random", |b| {
        let last = store.last_index().expect("last").expect("records");
        let mut tailer = store.create_tailer();
        let mut seq = 0u32;
        b.iter(|| {
            seq = seq.wrapping_mul(1_103_515_245).wrapping_add(12_345) % (last.seq() + 1);
            let index = vanilla_chronicle::GlobalIndex::new(last.segment(), seq);
            black_box(tailer.seek(index).expect("seek"))
        });
    });
    group.finish();
}

criterion_group!(benches, bench_tail);
criterion_main!(benches);
