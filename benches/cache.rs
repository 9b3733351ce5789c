use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use silt::serializer::{HeapSerializer, Serializer};
use silt::{Access, CacheOptions, PageCache};
use tempfile::tempdir;

fn bench_cache(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let heap = Arc::new(HeapSerializer::open(dir.path().join("bench.heap"), 4096).unwrap());
    let cache = PageCache::new(
        Arc::clone(&heap) as Arc<dyn Serializer>,
        CacheOptions::default(),
    )
    .unwrap();

    c.bench_function("create_write_commit", |b| {
        b.iter(|| {
            let txn = cache.begin();
            let (_block, mut lease) = txn.create();
            lease.write().unwrap().fill(0xAB);
            drop(lease);
            txn.commit().unwrap();
        })
    });

    let block = {
        let txn = cache.begin();
        let (block, mut lease) = txn.create();
        lease.write().unwrap().fill(0xCD);
        drop(lease);
        txn.commit().unwrap();
        block
    };

    c.bench_function("cached_read", |b| {
        b.iter(|| {
            let txn = cache.begin();
            let lease = txn.acquire(block, Access::Read);
            let first = lease.read().unwrap()[0];
            assert_eq!(first, 0xCD);
            drop(lease);
            txn.commit().unwrap();
        })
    });
}

criterion_group!(benches, bench_cache);
criterion_main!(benches);
