use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fluxrelay_core::hash::hash_str;
use fluxrelay_core::ring::Ring;
use rand::Rng;

fn ring_with(members: usize, tokens_per_member: usize) -> Ring {
    let ring = Ring::new();
    let mut rng = rand::thread_rng();
    for m in 0..members {
        for _ in 0..tokens_per_member {
            ring.put(rng.gen(), format!("node{}", m));
        }
    }
    ring
}

fn ring_lookups(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    let keys: Vec<u32> = (0..1024).map(|i| hash_str(&format!("host{}", i))).collect();
    group.throughput(Throughput::Elements(keys.len() as u64));

    for members in [3usize, 12, 48] {
        let ring = ring_with(members, 512);
        group.bench_with_input(BenchmarkId::new("get", members), &ring, |b, ring| {
            b.iter(|| {
                for key in &keys {
                    black_box(ring.get(*key));
                }
            })
        });
        group.bench_with_input(BenchmarkId::new("get_multi_3", members), &ring, |b, ring| {
            b.iter(|| {
                for key in &keys {
                    black_box(ring.get_multi(*key, 3));
                }
            })
        });
    }
    group.finish();
}

fn token_hashing(c: &mut Criterion) {
    let values: Vec<String> = (0..1024).map(|i| format!("server-{:04}", i)).collect();
    c.bench_function("hash_str", |b| {
        b.iter(|| {
            for v in &values {
                black_box(hash_str(v));
            }
        })
    });
}

criterion_group!(benches, ring_lookups, token_hashing);
criterion_main!(benches);
