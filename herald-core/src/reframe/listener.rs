//! The reframe listener: streaming provide ingestion.
//!
//! Many clients call [`ReframeListener::provide`] concurrently. Each CID is
//! deduplicated against the timestamp queue, bucketed into the open chunk,
//! and advertised through the engine once the bucket fills. Expiry runs on
//! every provide and on a timer; chunks that reference an expired CID are
//! retracted and their surviving CIDs re-bucketed so they stay advertised.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::chunker::{generate_context_id, ChunkIndex, CidsChunk};
use super::queue::CidQueue;
use super::store::{DsWrapper, SnapshotRecord};
use super::{now_ms, ReframeError};
use crate::ad::BITSWAP_METADATA;
use crate::datastore::Datastore;
use crate::engine::{EngineError, Provider, ProviderInfo};
use crate::lister::{ListerError, MultihashIterator, MultihashLister, VecIterator};
use crate::metrics::Metrics;

/// Fastest and slowest the expiry timer will run, regardless of TTL.
const MIN_EXPIRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

struct ListenerState {
    queue: CidQueue,
    chunks: ChunkIndex,
}

struct Inner {
    provider: Arc<dyn Provider>,
    store: DsWrapper,
    ttl_ms: u64,
    chunk_size: usize,
    snapshot_size: usize,
    provider_info: ProviderInfo,
    state: Mutex<ListenerState>,
    metrics: Metrics,
}

/// High-throughput live-provide buffer feeding the advertisement engine.
pub struct ReframeListener {
    inner: Arc<Inner>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReframeListener {
    /// Build a listener, register its lister on the engine, re-hydrate
    /// persisted state and start the expiry timer.
    pub async fn new(
        provider: Arc<dyn Provider>,
        ds: Arc<dyn Datastore>,
        ttl: Duration,
        chunk_size: usize,
        snapshot_size: usize,
        provider_info: ProviderInfo,
        metrics: Metrics,
    ) -> Result<Self, ReframeError> {
        assert!(chunk_size > 0, "chunk_size must be greater than 0");

        let store = DsWrapper::new(ds);
        provider
            .register_multihash_lister(chunk_lister(store.clone()))
            .await;

        let state = rehydrate(&store).await?;
        info!(
            "reframe listener ready: {} queued CIDs, {} chunks, {} open",
            state.queue.len(),
            state.chunks.chunk_count(),
            state.chunks.current_len(),
        );

        let inner = Arc::new(Inner {
            provider,
            store,
            ttl_ms: ttl.as_millis() as u64,
            chunk_size,
            snapshot_size,
            provider_info,
            state: Mutex::new(state),
            metrics,
        });

        let expiry_inner = Arc::clone(&inner);
        let expiry_interval = (ttl / 2).clamp(MIN_EXPIRY_INTERVAL, MAX_EXPIRY_INTERVAL);
        let expiry_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(expiry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut state = expiry_inner.state.lock().await;
                if let Err(err) = expiry_inner.expire(&mut state, now_ms()).await {
                    warn!("reframe expiry failed: {}", err);
                }
                debug!(
                    "reframe stats: {} provides, {} chunks flushed, {} snapshots, {} queued",
                    expiry_inner.metrics.provides(),
                    expiry_inner.metrics.chunks_flushed(),
                    expiry_inner.metrics.snapshots_taken(),
                    state.queue.len(),
                );
            }
        });

        Ok(Self {
            inner,
            expiry_task: Mutex::new(Some(expiry_task)),
        })
    }

    /// Ingest one CID. Safe to call from many tasks concurrently.
    pub async fn provide(&self, cid: Cid) -> Result<(), ReframeError> {
        let now = now_ms();
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if state.queue.touch(cid, now) {
            inner.store.put_timestamp(&cid, now).await?;
            inner.metrics.provide(true);
        } else {
            state.queue.push_back(cid, now);
            inner.store.put_timestamp(&cid, now).await?;
            state.chunks.add_to_current(cid);
            inner.metrics.provide(false);
            if state.chunks.current_len() >= inner.chunk_size {
                inner.flush_current(&mut state).await?;
            }
        }

        inner.expire(&mut state, now).await
    }

    /// Ingest a batch under one lock acquisition.
    pub async fn provide_many(
        &self,
        cids: impl IntoIterator<Item = Cid>,
    ) -> Result<(), ReframeError> {
        let now = now_ms();
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        for cid in cids {
            if state.queue.touch(cid, now) {
                inner.store.put_timestamp(&cid, now).await?;
                inner.metrics.provide(true);
                continue;
            }
            state.queue.push_back(cid, now);
            inner.store.put_timestamp(&cid, now).await?;
            state.chunks.add_to_current(cid);
            inner.metrics.provide(false);
            if state.chunks.current_len() >= inner.chunk_size {
                inner.flush_current(&mut state).await?;
            }
        }

        inner.expire(&mut state, now).await
    }

    /// Stop the expiry timer. Queued state stays on disk.
    pub async fn close(&self) {
        let mut task = self.expiry_task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }

    // Inspection helpers, mirrored by the integration tests.

    pub async fn queued_len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn has_cid(&self, cid: &Cid) -> bool {
        self.inner.state.lock().await.queue.contains(cid)
    }

    pub async fn context_for_cid(&self, cid: &Cid) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .await
            .chunks
            .context_for_cid(cid)
            .cloned()
    }

    pub async fn chunk_count(&self) -> usize {
        self.inner.state.lock().await.chunks.chunk_count()
    }

    pub async fn current_len(&self) -> usize {
        self.inner.state.lock().await.chunks.current_len()
    }
}

impl Inner {
    /// Close the open bucket, persist it and advertise it.
    async fn flush_current(&self, state: &mut ListenerState) -> Result<(), ReframeError> {
        let chunk = state.chunks.take_current();
        self.store.put_chunk(&chunk).await?;
        self.metrics.chunk_flushed();

        match self
            .provider
            .notify_put(
                Some(self.provider_info.clone()),
                &chunk.context_id,
                BITSWAP_METADATA,
            )
            .await
        {
            Ok(ad) => debug!(
                "advertised chunk of {} CIDs as {}",
                chunk.cids.len(),
                ad
            ),
            // Deterministic context IDs make re-derived buckets collide
            // with their pre-restart ads; that is the point.
            Err(EngineError::AlreadyAdvertised(_)) => {
                debug!("chunk already advertised, skipping")
            }
            Err(err) => return Err(err.into()),
        }

        if state.chunks.chunk_count() > self.snapshot_size {
            self.snapshot(state).await?;
        }
        Ok(())
    }

    /// Evict everything older than the TTL and retract the chunks that
    /// referenced it.
    async fn expire(&self, state: &mut ListenerState, now: u64) -> Result<(), ReframeError> {
        let cutoff = now.saturating_sub(self.ttl_ms);
        let mut expired = Vec::new();
        while let Some((cid, ts)) = state.queue.front() {
            if ts >= cutoff {
                break;
            }
            state.queue.pop_front();
            expired.push(cid);
        }
        if expired.is_empty() {
            return Ok(());
        }

        self.store.delete_timestamps(&expired).await?;
        self.metrics.cids_expired(expired.len() as u64);
        debug!("expired {} CIDs", expired.len());

        let mut retract: BTreeSet<Vec<u8>> = BTreeSet::new();
        for cid in &expired {
            match state.chunks.context_for_cid(cid) {
                Some(ctx) => {
                    retract.insert(ctx.clone());
                }
                None => state.chunks.remove_from_current(cid),
            }
        }

        for ctx in retract {
            let Some(chunk) = state.chunks.remove_chunk(&ctx) else {
                continue;
            };
            self.store.mark_chunk_removed(&chunk).await?;
            if let Err(err) = self
                .provider
                .notify_remove(Some(self.provider_info.id), &ctx)
                .await
            {
                warn!("failed to retract expired chunk: {}", err);
            }
            // CIDs of the retracted chunk that are still alive go back into
            // the open bucket so they stay advertised.
            for cid in chunk.cids {
                if state.queue.contains(&cid) {
                    state.chunks.add_to_current(cid);
                }
            }
        }

        while state.chunks.current_len() >= self.chunk_size {
            self.flush_current(state).await?;
        }
        Ok(())
    }

    /// Collapse every persisted chunk into one and advertise the union.
    async fn snapshot(&self, state: &mut ListenerState) -> Result<(), ReframeError> {
        let old = state.chunks.drain_chunks();
        let old_ctxs: Vec<Vec<u8>> = old.iter().map(|c| c.context_id.clone()).collect();

        let mut union: BTreeSet<Cid> = BTreeSet::new();
        for chunk in &old {
            union.extend(chunk.cids.iter().copied());
        }
        union.retain(|c| state.queue.contains(c));

        let merged = CidsChunk {
            context_id: generate_context_id(&union),
            cids: union,
            removed: false,
        };
        state.chunks.index_chunk(merged.clone());

        for ctx in &old_ctxs {
            self.store.delete_chunk(ctx).await?;
        }
        self.store.put_chunk(&merged).await?;
        self.store
            .put_snapshot(&SnapshotRecord {
                current_cids: state
                    .chunks
                    .current_cids()
                    .iter()
                    .map(|c| c.to_bytes())
                    .collect(),
                flushed_context_ids: old_ctxs,
            })
            .await?;
        self.metrics.snapshot_taken();

        match self
            .provider
            .notify_put(
                Some(self.provider_info.clone()),
                &merged.context_id,
                BITSWAP_METADATA,
            )
            .await
        {
            Ok(_) | Err(EngineError::AlreadyAdvertised(_)) => {}
            Err(err) => return Err(err.into()),
        }

        info!(
            "collapsed {} chunks into snapshot of {} CIDs",
            old.len(),
            merged.cids.len()
        );
        Ok(())
    }
}

/// The lister registered on the engine: resolves a reframe context ID back
/// to the multihashes of its persisted chunk.
fn chunk_lister(store: DsWrapper) -> MultihashLister {
    Arc::new(move |_provider, context_id| {
        let store = store.clone();
        Box::pin(async move {
            let chunk = store
                .get_chunk(&context_id)
                .await
                .map_err(|e| ListerError::Failed(e.to_string()))?
                .ok_or(ListerError::UnknownContext)?;
            let mhs = chunk.cids.iter().map(|c| *c.hash()).collect();
            Ok(Box::new(VecIterator::new(mhs)) as Box<dyn MultihashIterator>)
        })
    })
}

/// Rebuild in-memory indexes from persisted chunks and timestamps.
async fn rehydrate(store: &DsWrapper) -> Result<ListenerState, ReframeError> {
    let mut state = ListenerState {
        queue: CidQueue::new(),
        chunks: ChunkIndex::new(),
    };

    for chunk in store.list_chunks().await? {
        if !chunk.removed {
            state.chunks.index_chunk(chunk);
        }
    }

    let mut timestamps = store.list_timestamps().await?;
    timestamps.sort_by_key(|(_, ts)| *ts);
    for (cid, ts) in timestamps {
        state.queue.push_back(cid, ts);
        // Anything queued but not referenced by a flushed chunk belongs to
        // the open bucket.
        if state.chunks.context_for_cid(&cid).is_none() {
            state.chunks.add_to_current(cid);
        }
    }

    if let Some(snapshot) = store.latest_snapshot().await? {
        debug!(
            "loaded snapshot covering {} collapsed chunks",
            snapshot.flushed_context_ids.len()
        );
    }
    Ok(state)
}
