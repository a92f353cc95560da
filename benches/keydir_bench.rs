use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use keydir::{Keydir, KeydirOptions, PutEntry};

fn make_keydir(num_pages: u32) -> (tempfile::TempDir, Keydir) {
    let dir = tempfile::tempdir().unwrap();
    let options = KeydirOptions::new(dir.path())
        .num_pages(num_pages)
        .initial_num_swap_pages(64);
    let kd = Keydir::open(options).unwrap();
    (dir, kd)
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    for &num_keys in &[1_000u32, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(num_keys), &num_keys, |b, &num_keys| {
            let (_dir, kd) = make_keydir(4096);
            let mut i = 0u32;
            b.iter(|| {
                let key = format!("key-{}", i % num_keys).into_bytes();
                let entry = PutEntry {
                    key,
                    file_id: 1,
                    total_size: 128,
                    offset: i as u64 * 128,
                    timestamp: 1_700_000_000,
                };
                black_box(kd.put(entry, None));
                i = i.wrapping_add(1);
            });
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    for &num_keys in &[1_000u32, 10_000] {
        let (_dir, kd) = make_keydir(4096);
        for i in 0..num_keys {
            let key = format!("key-{i}").into_bytes();
            kd.put(
                PutEntry {
                    key,
                    file_id: 1,
                    total_size: 128,
                    offset: i as u64 * 128,
                    timestamp: 1_700_000_000,
                },
                None,
            );
        }
        let epoch = kd.current_epoch();
        group.bench_with_input(BenchmarkId::from_parameter(num_keys), &num_keys, |b, &num_keys| {
            let mut i = 0u32;
            b.iter(|| {
                let key = format!("key-{}", i % num_keys).into_bytes();
                black_box(kd.get(&key, epoch));
                i = i.wrapping_add(1);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
