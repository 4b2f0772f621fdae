use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rand_xoshiro::rand_core::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use std::hint::black_box;
use std::io::Cursor;

fn criterion_benchmark(c: &mut Criterion) {
    let mut rng = Xoshiro256Plus::seed_from_u64(0x9ae16a3b2f90404f);
    let mut old = vec![0u8; 1 << 20];
    rng.fill_bytes(&mut old);

    // shift half the input and scribble on every page to give the generator real work
    let mut new = old.clone();
    new.copy_within(0..(1 << 19), 1 << 18);
    for i in (0..new.len()).step_by(4096) {
        new[i] = new[i].wrapping_add(1);
    }

    let mut patch = Vec::new();
    bdelta::generate(&old, &new, &mut patch, 0).unwrap();

    let mut group = c.benchmark_group("throughput");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(new.len() as u64));
    group.bench_function("generate", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(patch.len());
            bdelta::generate(black_box(&old), black_box(&new), &mut out, 0).unwrap();
            out
        })
    });
    group.bench_function("apply", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(new.len());
            let mut reader = &patch[..];
            bdelta::apply(&mut Cursor::new(black_box(&old)), &mut out, &mut reader).unwrap();
            out
        })
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
