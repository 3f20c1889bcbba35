use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use libp2p::identity::PeerId;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use tokio::runtime::Runtime;

use herald_core::engine::{EngineError, Provider, ProviderInfo};
use herald_core::entries::write_entries;
use herald_core::link::{node_cid, LinkSystem, SHA256_CODE};
use herald_core::lister::{MultihashLister, VecIterator};
use herald_core::{MemDatastore, Metrics, ReframeListener};

/// Provider stub that swallows advertisements, so the bench measures the
/// listener alone.
struct NullProvider;

#[async_trait]
impl Provider for NullProvider {
    async fn register_multihash_lister(&self, _lister: MultihashLister) {}

    async fn notify_put(
        &self,
        _provider: Option<ProviderInfo>,
        context_id: &[u8],
        _metadata: &[u8],
    ) -> Result<Cid, EngineError> {
        Ok(node_cid(0xad01, context_id).unwrap())
    }

    async fn notify_remove(
        &self,
        _provider: Option<PeerId>,
        context_id: &[u8],
    ) -> Result<Cid, EngineError> {
        Ok(node_cid(0xad01, context_id).unwrap())
    }
}

fn bench_cids(n: usize) -> Vec<Cid> {
    (0..n)
        .map(|i| node_cid(0x55, format!("bench{i}").as_bytes()).unwrap())
        .collect()
}

async fn bench_listener() -> ReframeListener {
    ReframeListener::new(
        Arc::new(NullProvider),
        MemDatastore::shared(),
        Duration::from_secs(24 * 60 * 60),
        10_000,
        1000,
        ProviderInfo {
            id: PeerId::random(),
            addrs: vec!["/ip4/127.0.0.1/tcp/3103".parse().unwrap()],
        },
        Metrics::new(),
    )
    .await
    .unwrap()
}

/// Benchmark: streaming provide ingestion through the reframe listener.
fn bench_reframe_provide(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("reframe_provide");
    for &batch in &[1_000usize, 100_000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(format!("provide_many_{batch}"), |b| {
            let cids = bench_cids(batch);
            b.to_async(&rt).iter(|| async {
                let listener = bench_listener().await;
                listener.provide_many(black_box(cids.clone())).await.unwrap();
                listener.close().await;
            });
        });
    }
    group.finish();
}

/// Benchmark: entry chunker writing back-linked chunk chains.
fn bench_entry_chunker(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mhs: Vec<Multihash<64>> = (0..10_000u32)
        .map(|i| {
            let digest = Sha256::digest(i.to_be_bytes());
            Multihash::wrap(SHA256_CODE, &digest).unwrap()
        })
        .collect();

    c.bench_function("write_entries_10k", |b| {
        b.to_async(&rt).iter(|| async {
            let links = LinkSystem::new(MemDatastore::shared());
            let mut iter = VecIterator::new(mhs.clone());
            black_box(
                write_entries(&links, 1024, &mut iter, &Metrics::new())
                    .await
                    .unwrap(),
            );
        });
    });
}

criterion_group!(benches, bench_reframe_provide, bench_entry_chunker);
criterion_main!(benches);
