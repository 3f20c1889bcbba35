//! End-to-end sync over the HTTP transport: publish a batch through the
//! engine, then act as an indexer polling `/head` and walking the DAG
//! block by block.

use std::collections::HashSet;
use std::sync::Arc;

use multihash::Multihash;
use sha2::{Digest, Sha256};

use herald_core::engine::Provider;
use herald_core::link::SHA256_CODE;
use herald_core::{Advertisement, Engine, EntriesChunk, MhStore, PublisherKind, SignedHead};

fn mhs(n: usize) -> Vec<Multihash<64>> {
    (0..n)
        .map(|i| {
            let digest = Sha256::digest(format!("applesauce-{i}"));
            Multihash::wrap(SHA256_CODE, &digest).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn test_indexer_pulls_published_chain_over_http() {
    let engine = Arc::new(
        Engine::builder()
            .with_publisher_kind(PublisherKind::Http)
            .with_http_listen_addr("127.0.0.1:0".parse().unwrap())
            .with_chunk_size(8)
            .with_retrieval_addrs(vec!["/ip4/127.0.0.1/tcp/9999".to_string()])
            .build()
            .unwrap(),
    );
    engine.start().await.unwrap();

    let store = MhStore::new();
    engine.register_multihash_lister(store.lister()).await;
    let input = mhs(20);
    store.put(b"applesauce", input.clone()).await;

    let published = engine
        .notify_put(None, b"applesauce", b"meta-0")
        .await
        .unwrap();

    let base = format!("http://{}", engine.http_addr().await.unwrap());
    let client = reqwest::Client::new();

    // The polled head is exactly the CID the provider just published, and
    // the record authenticates against the provider identity.
    let signed: SignedHead = client
        .get(format!("{base}/head"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let (head, signer) = signed.verify().unwrap();
    assert_eq!(head, published);
    assert_eq!(signer, engine.provider_id());

    // Pull the ad block and verify its signature client-side.
    let ad_bytes = client
        .get(format!("{base}/{head}"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let ad = Advertisement::decode(&ad_bytes).unwrap();
    assert_eq!(ad.verify_signature().unwrap(), engine.provider_id());
    assert_eq!(ad.previous_id, None);

    // Walk the entries chain like a syncing indexer would.
    let mut pulled: HashSet<Multihash<64>> = HashSet::new();
    let mut cursor = ad.entries;
    while let Some(chunk_cid) = cursor {
        let chunk_bytes = client
            .get(format!("{base}/{chunk_cid}"))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let chunk = EntriesChunk::decode(&chunk_bytes).unwrap();
        pulled.extend(chunk.entries);
        cursor = chunk.next;
    }
    let want: HashSet<Multihash<64>> = input.into_iter().collect();
    assert_eq!(pulled, want);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_head_advances_as_chain_grows() {
    let engine = Arc::new(
        Engine::builder()
            .with_publisher_kind(PublisherKind::Http)
            .with_http_listen_addr("127.0.0.1:0".parse().unwrap())
            .with_retrieval_addrs(vec!["/ip4/127.0.0.1/tcp/9999".to_string()])
            .build()
            .unwrap(),
    );
    engine.start().await.unwrap();
    let store = MhStore::new();
    engine.register_multihash_lister(store.lister()).await;

    let base = format!("http://{}", engine.http_addr().await.unwrap());
    let client = reqwest::Client::new();

    store.put(b"ctx-a", mhs(3)).await;
    let first = engine.notify_put(None, b"ctx-a", b"m").await.unwrap();
    let signed: SignedHead = client
        .get(format!("{base}/head"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(signed.verify().unwrap().0, first);

    store.put(b"ctx-b", mhs(4)).await;
    let second = engine.notify_put(None, b"ctx-b", b"m").await.unwrap();
    let signed: SignedHead = client
        .get(format!("{base}/head"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(signed.verify().unwrap().0, second);

    // The second ad chains back to the first.
    let ad_bytes = client
        .get(format!("{base}/{second}"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let ad = Advertisement::decode(&ad_bytes).unwrap();
    assert_eq!(ad.previous_id, Some(first));

    engine.shutdown().await.unwrap();
}
