//! Micro benchmarks for the int-to-int index.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_intmap::{IntMapOptions, IntToIntBTree, Lookup};
use tempfile::TempDir;

const INSERT_COUNT: i32 = 65_536;
const LOOKUP_SAMPLES: usize = 4_096;

fn bench_options() -> IntMapOptions {
    IntMapOptions::default().node_size(4096).storage_page_size(256 * 1024)
}

fn micro_intmap(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/intmap");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT as u64));
    group.bench_function("sequential_put", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut fresh| {
                for key in 1..=INSERT_COUNT {
                    fresh.tree.put(key, key).expect("put");
                }
                black_box(fresh.tree.len());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<i32> = (1..=INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.bench_function("random_put", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut fresh| {
                for &key in &random_keys {
                    fresh.tree.put(key, key).expect("put");
                }
                black_box(fresh.tree.len());
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("lookup_then_insert_at", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut fresh| {
                for &key in &random_keys {
                    if let Lookup::Vacant(slot) = fresh.tree.lookup(key).expect("lookup") {
                        fresh.tree.insert_at(slot, key).expect("insert");
                    }
                }
                black_box(fresh.tree.len());
            },
            BatchSize::SmallInput,
        );
    });

    let mut loaded = FreshTree::new();
    for &key in &random_keys {
        loaded.tree.put(key, key).expect("put");
    }
    let mut rng = ChaCha8Rng::seed_from_u64(0xFEED_FACE);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_get", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            for _ in 0..LOOKUP_SAMPLES {
                let key = rng.gen_range(1..=INSERT_COUNT);
                black_box(loaded.tree.get(key).expect("get"));
            }
        });
    });

    group.throughput(Throughput::Elements(INSERT_COUNT as u64));
    group.bench_function("process_mappings", |b| {
        b.iter(|| {
            let mut sum = 0i64;
            loaded
                .tree
                .process_mappings(|_, value| {
                    sum += i64::from(value);
                    true
                })
                .expect("scan");
            black_box(sum);
        });
    });

    group.finish();
}

struct FreshTree {
    _tmpdir: TempDir,
    tree: IntToIntBTree,
}

impl FreshTree {
    fn new() -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let path = tmpdir.path().join("intmap.idx");
        let tree = IntToIntBTree::create(&path, bench_options()).expect("tree");
        Self {
            _tmpdir: tmpdir,
            tree,
        }
    }
}

criterion_group!(benches, micro_intmap);
criterion_main!(benches);
