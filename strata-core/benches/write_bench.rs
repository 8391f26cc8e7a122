use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use strata_core::memtable::MemTable;
use strata_core::query::{MemChunkReader, PointReader, Priority, PriorityMergeReader, SourceTier};
use strata_core::storage::{StorageConfig, StorageEngine};
use strata_core::wal::{SyncPolicy, WalConfig};
use strata_core::{SeriesKey, TimeRange, TsValue};
use tempfile::TempDir;

const POINTS: i64 = 20_000;

fn shuffled_times(seed: u64) -> Vec<i64> {
    let mut times: Vec<i64> = (0..POINTS).collect();
    times.shuffle(&mut StdRng::seed_from_u64(seed));
    times
}

fn bench_memtable(c: &mut Criterion) {
    let key = SeriesKey::new("root.bench.d1", "s1");
    let shuffled = shuffled_times(7);
    let mut group = c.benchmark_group("memtable");

    group.bench_function("insert_in_order_20k", |b| {
        b.iter_batched(
            || MemTable::new(1),
            |memtable| {
                for t in 0..POINTS {
                    memtable
                        .insert(black_box(&key), black_box(t), TsValue::Double(t as f64))
                        .unwrap();
                }
                memtable
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("insert_shuffled_then_sort_20k", |b| {
        b.iter_batched(
            || MemTable::new(1),
            |memtable| {
                for t in &shuffled {
                    memtable
                        .insert(black_box(&key), black_box(*t), TsValue::Double(*t as f64))
                        .unwrap();
                }
                let chunk = memtable.chunk(&key).unwrap();
                black_box(chunk.sorted_list_for_query().len())
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_merge_reader(c: &mut Criterion) {
    let key = SeriesKey::new("root.bench.d1", "s1");
    let sources: Vec<_> = (0..4u64)
        .map(|i| {
            let memtable = MemTable::new(i);
            for t in shuffled_times(i) {
                memtable.insert(&key, t, TsValue::Int64(t * i as i64)).unwrap();
            }
            memtable.chunk(&key).unwrap().sorted_list_for_query()
        })
        .collect();

    c.bench_function("merge_4x20k_overlapping", |b| {
        b.iter(|| {
            let mut reader = PriorityMergeReader::new();
            for (i, list) in sources.iter().enumerate() {
                let tier = if i == 0 {
                    SourceTier::SeqFile
                } else {
                    SourceTier::UnseqFile
                };
                reader
                    .add_reader(
                        Box::new(MemChunkReader::new(list.clone(), TimeRange::all(), Vec::new())),
                        Priority::new(tier, i as u64),
                    )
                    .unwrap();
            }
            let mut count = 0usize;
            while reader.next().unwrap().is_some() {
                count += 1;
            }
            black_box(count)
        });
    });
}

fn bench_engine_ingest(c: &mut Criterion) {
    let key = SeriesKey::new("root.bench.d1", "s1");
    c.bench_function("engine_ingest_20k_wal", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let engine = StorageEngine::open(StorageConfig {
                    data_dir: dir.path().to_path_buf(),
                    wal: WalConfig {
                        enabled: true,
                        sync_policy: SyncPolicy::None,
                    },
                    ..Default::default()
                })
                .unwrap();
                (dir, engine)
            },
            |(_dir, engine)| {
                for t in 0..POINTS {
                    engine
                        .insert("root.bench", &key, black_box(t), TsValue::Int64(t))
                        .unwrap();
                }
                engine.shutdown().unwrap();
            },
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, bench_memtable, bench_merge_reader, bench_engine_ingest);
criterion_main!(benches);
