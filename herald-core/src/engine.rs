//! The advertisement engine.
//!
//! Coordinates the chunker, ad builder, head store and publication
//! transports behind a small facade: `notify_put`, `notify_remove`,
//! `publish`, `get_latest_adv` plus lifecycle. Publishes are strictly
//! serialized, so every ad's `previous_id` equals the head observed at the
//! start of that publish and the chain can never fork.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use libp2p::identity::{Keypair, PeerId};
use libp2p::Multiaddr;
use prost::Message as ProstMessage;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::ad::{AdError, Advertisement};
use crate::announce::Announcer;
use crate::config::Config;
use crate::datastore::{BatchOp, Datastore, MemDatastore, StoreError};
use crate::dtsync_publisher::{DtSyncPublisher, SyncPolicy};
use crate::entries::{write_entries, ChunkerError, DEFAULT_CHUNK_SIZE};
use crate::head::HeadStore;
use crate::http_publisher::HttpPublisher;
use crate::link::{LinkError, LinkSystem, AD_CODEC};
use crate::lister::{ListerError, MultihashLister};
use crate::metrics::Metrics;
use crate::publisher::{PublishError, Publisher, PublisherKind};

const CTX_KEY_PREFIX: &[u8] = b"/ad/ctx/";

#[derive(Debug, Error)]
pub enum EngineError {
    /// The context is already advertised with identical metadata; the
    /// carried CID is the existing advertisement.
    #[error("already advertised as {0}")]
    AlreadyAdvertised(Cid),

    #[error("unknown context")]
    UnknownContext,

    #[error("context id must not be empty")]
    EmptyContext,

    #[error("no multihash lister registered")]
    NoLister,

    #[error("previous id {got:?} does not match current head {expected:?}")]
    ChainBroken {
        expected: Option<Cid>,
        got: Option<Cid>,
    },

    #[error("engine not started")]
    NotStarted,

    #[error("invalid advertisement: {0}")]
    Ad(#[from] AdError),

    #[error("entry chunker failed: {0}")]
    Chunker(#[from] ChunkerError),

    #[error("lister failed: {0}")]
    Lister(ListerError),

    #[error("datastore failed: {0}")]
    Store(#[from] StoreError),

    #[error("link system failed: {0}")]
    Link(#[from] LinkError),

    #[error("publication failed: {0}")]
    Publish(#[from] PublishError),

    #[error("shutdown failures: {0}")]
    Shutdown(String),

    #[error("engine misconfigured: {0}")]
    Config(String),
}

/// Provider identity announced on an advertisement.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// The engine surface consumed by ingestion frontends such as the reframe
/// listener. Kept narrow so frontends can be tested against a stub.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Install the multihash lister. Exactly one may be registered;
    /// re-registration replaces.
    async fn register_multihash_lister(&self, lister: MultihashLister);

    async fn notify_put(
        &self,
        provider: Option<ProviderInfo>,
        context_id: &[u8],
        metadata: &[u8],
    ) -> Result<Cid, EngineError>;

    async fn notify_remove(
        &self,
        provider: Option<PeerId>,
        context_id: &[u8],
    ) -> Result<Cid, EngineError>;
}

/// Per-context advertisement state: what was last announced.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CtxState {
    metadata: Vec<u8>,
    entries: Option<Cid>,
    ad: Cid,
}

#[derive(Clone, PartialEq, prost::Message)]
struct CtxRecord {
    #[prost(bytes = "vec", tag = "1")]
    metadata: Vec<u8>,

    #[prost(bytes = "vec", optional, tag = "2")]
    entries: Option<Vec<u8>>,

    #[prost(bytes = "vec", tag = "3")]
    ad: Vec<u8>,
}

/// Bounded recency cache over the persisted context records.
struct CtxCache {
    cap: usize,
    map: HashMap<Vec<u8>, CtxState>,
    order: VecDeque<Vec<u8>>,
}

impl CtxCache {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<CtxState> {
        let state = self.map.get(key)?.clone();
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_vec());
        Some(state)
    }

    fn put(&mut self, key: Vec<u8>, state: CtxState) {
        if self.map.insert(key.clone(), state).is_none() {
            self.order.push_back(key);
        } else {
            self.order.retain(|k| k != &key);
            self.order.push_back(key);
        }
        while self.map.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
    }

    fn remove(&mut self, key: &[u8]) {
        self.map.remove(key);
        self.order.retain(|k| k != key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Builder for [`Engine`]; every knob has a sensible default.
pub struct EngineBuilder {
    key: Option<Keypair>,
    ds: Option<Arc<dyn Datastore>>,
    publisher_kind: PublisherKind,
    chunk_size: usize,
    cache_size: usize,
    topic: String,
    retrieval_addrs: Vec<String>,
    direct_announce_urls: Vec<String>,
    http_listen_addr: SocketAddr,
    listen_addrs: Vec<Multiaddr>,
    sync_policy: SyncPolicy,
    metrics: Option<Metrics>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            key: None,
            ds: None,
            publisher_kind: PublisherKind::DtSync,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_size: 1024,
            topic: "/indexer/ingest/mainnet".to_string(),
            retrieval_addrs: Vec::new(),
            direct_announce_urls: Vec::new(),
            http_listen_addr: "0.0.0.0:3104".parse().expect("valid default addr"),
            listen_addrs: Vec::new(),
            sync_policy: SyncPolicy::default(),
            metrics: None,
        }
    }
}

impl EngineBuilder {
    /// Seed a builder from a loaded [`Config`].
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let mut builder = Self::default()
            .with_publisher_kind(config.ingest.publisher_kind)
            .with_chunk_size(config.ingest.linked_chunk_size)
            .with_cache_size(config.ingest.link_cache_size)
            .with_topic(config.ingest.pubsub_topic.clone())
            .with_direct_announce(config.direct_announce_urls.clone());

        builder.http_listen_addr = config
            .ingest
            .http_listen_addr
            .parse()
            .map_err(|e| EngineError::Config(format!("bad http listen addr: {e}")))?;
        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|_| EngineError::Config("bad listen port".to_string()))?;
        builder.listen_addrs = vec![listen];

        let mut except = std::collections::HashSet::new();
        for peer in &config.ingest.sync_policy.except {
            let id: PeerId = peer
                .parse()
                .map_err(|_| EngineError::Config(format!("bad peer id: {peer}")))?;
            except.insert(id);
        }
        builder.sync_policy = SyncPolicy {
            allow: config.ingest.sync_policy.allow,
            except,
        };
        Ok(builder)
    }

    pub fn with_keypair(mut self, key: Keypair) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_datastore(mut self, ds: Arc<dyn Datastore>) -> Self {
        self.ds = Some(ds);
        self
    }

    pub fn with_publisher_kind(mut self, kind: PublisherKind) -> Self {
        self.publisher_kind = kind;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_topic(mut self, topic: String) -> Self {
        self.topic = topic;
        self
    }

    /// Multiaddrs announced as this provider's retrieval addresses.
    pub fn with_retrieval_addrs(mut self, addrs: Vec<String>) -> Self {
        self.retrieval_addrs = addrs;
        self
    }

    pub fn with_direct_announce(mut self, urls: Vec<String>) -> Self {
        self.direct_announce_urls = urls;
        self
    }

    pub fn with_http_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.http_listen_addr = addr;
        self
    }

    pub fn with_listen_addrs(mut self, addrs: Vec<Multiaddr>) -> Self {
        self.listen_addrs = addrs;
        self
    }

    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::Config("chunk size must be positive".into()));
        }
        let key = self.key.unwrap_or_else(Keypair::generate_ed25519);
        let provider_id = PeerId::from(key.public());
        let ds = self.ds.unwrap_or_else(MemDatastore::shared);
        let metrics = self.metrics.unwrap_or_default();

        let mut retrieval_addrs = self.retrieval_addrs;
        if retrieval_addrs.is_empty() {
            retrieval_addrs = if self.listen_addrs.is_empty() {
                vec!["/ip4/127.0.0.1/tcp/3103".to_string()]
            } else {
                self.listen_addrs.iter().map(|a| a.to_string()).collect()
            };
        }
        for addr in &retrieval_addrs {
            addr.parse::<Multiaddr>()
                .map_err(|_| EngineError::Ad(AdError::BadMultiaddr(addr.clone())))?;
        }

        let announcer = Announcer::new(
            self.direct_announce_urls,
            self.topic.clone(),
            retrieval_addrs.clone(),
            metrics.clone(),
        );

        Ok(Engine {
            key,
            provider_id,
            retrieval_addrs,
            links: LinkSystem::new(Arc::clone(&ds)),
            heads: HeadStore::new(Arc::clone(&ds)),
            ds,
            chunk_size: self.chunk_size,
            topic: self.topic,
            publisher_kind: self.publisher_kind,
            http_listen_addr: self.http_listen_addr,
            listen_addrs: self.listen_addrs,
            sync_policy: self.sync_policy,
            lister: RwLock::new(None),
            ctx_cache: Mutex::new(CtxCache::new(self.cache_size)),
            publish_lock: Mutex::new(()),
            publisher: RwLock::new(None),
            bound_http_addr: RwLock::new(None),
            lifecycle: RwLock::new(Lifecycle::Created),
            announcer,
            metrics,
        })
    }
}

/// The advertisement engine facade.
pub struct Engine {
    key: Keypair,
    provider_id: PeerId,
    retrieval_addrs: Vec<String>,
    ds: Arc<dyn Datastore>,
    links: LinkSystem,
    heads: HeadStore,
    chunk_size: usize,
    topic: String,

    publisher_kind: PublisherKind,
    http_listen_addr: SocketAddr,
    listen_addrs: Vec<Multiaddr>,
    sync_policy: SyncPolicy,

    lister: RwLock<Option<MultihashLister>>,
    ctx_cache: Mutex<CtxCache>,
    /// Serializes every head mutation.
    publish_lock: Mutex<()>,
    publisher: RwLock<Option<Arc<dyn Publisher>>>,
    bound_http_addr: RwLock<Option<SocketAddr>>,
    lifecycle: RwLock<Lifecycle>,
    announcer: Announcer,
    metrics: Metrics,
}

fn ctx_key(context_id: &[u8]) -> Vec<u8> {
    let mut key = CTX_KEY_PREFIX.to_vec();
    key.extend_from_slice(context_id);
    key
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn provider_id(&self) -> PeerId {
        self.provider_id
    }

    pub fn link_system(&self) -> &LinkSystem {
        &self.links
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Bound address of the HTTP publisher, once started with the http
    /// kind.
    pub async fn http_addr(&self) -> Option<SocketAddr> {
        *self.bound_http_addr.read().await
    }

    /// Start the publication transport. Idempotent.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.write().await;
        if *lifecycle == Lifecycle::Running {
            return Ok(());
        }

        let publisher: Arc<dyn Publisher> = match self.publisher_kind {
            PublisherKind::Http => {
                let http = HttpPublisher::bind(
                    self.http_listen_addr,
                    self.links.clone(),
                    self.key.clone(),
                    self.topic.clone(),
                    self.metrics.clone(),
                )
                .await?;
                *self.bound_http_addr.write().await = Some(http.local_addr());
                Arc::new(http)
            }
            PublisherKind::DtSync => {
                let listen_addrs = if self.listen_addrs.is_empty() {
                    vec!["/ip4/0.0.0.0/tcp/3103".parse().expect("valid multiaddr")]
                } else {
                    self.listen_addrs.clone()
                };
                Arc::new(
                    DtSyncPublisher::new(
                        self.key.clone(),
                        self.links.clone(),
                        self.topic.clone(),
                        listen_addrs,
                        self.retrieval_addrs.clone(),
                        self.sync_policy.clone(),
                        self.metrics.clone(),
                    )
                    .await?,
                )
            }
        };

        // Re-expose the persisted head after a restart.
        if let Some(head) = self.heads.head().await? {
            publisher.update_head(head).await?;
        }

        *self.publisher.write().await = Some(publisher);
        *lifecycle = Lifecycle::Running;
        info!("engine started as provider {}", self.provider_id);
        Ok(())
    }

    /// Stop the transport. A hard error if [`Engine::start`] was never
    /// called; idempotent afterwards. Component failures are collected
    /// rather than short-circuited.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle.write().await;
        match *lifecycle {
            Lifecycle::Created => return Err(EngineError::NotStarted),
            Lifecycle::Stopped => return Ok(()),
            Lifecycle::Running => {}
        }

        let mut failures = Vec::new();
        if let Some(publisher) = self.publisher.write().await.take() {
            if let Err(err) = publisher.shutdown().await {
                failures.push(format!("publisher: {err}"));
            }
        }

        *lifecycle = Lifecycle::Stopped;
        info!("engine stopped");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Shutdown(failures.join("; ")))
        }
    }

    async fn ensure_running(&self) -> Result<(), EngineError> {
        match *self.lifecycle.read().await {
            Lifecycle::Running => Ok(()),
            _ => Err(EngineError::NotStarted),
        }
    }

    /// Latest advertisement, or `None` for an empty chain.
    pub async fn get_latest_adv(&self) -> Result<Option<(Cid, Advertisement)>, EngineError> {
        match self.heads.head().await? {
            Some(head) => {
                let ad = self.get_adv(&head).await?;
                Ok(Some((head, ad)))
            }
            None => Ok(None),
        }
    }

    /// Load any advertisement by CID.
    pub async fn get_adv(&self, cid: &Cid) -> Result<Advertisement, EngineError> {
        let bytes = self.links.load(cid).await?;
        Ok(Advertisement::decode(&bytes)?)
    }

    async fn ctx_state(&self, context_id: &[u8]) -> Result<Option<CtxState>, EngineError> {
        {
            let mut cache = self.ctx_cache.lock().await;
            if let Some(state) = cache.get(context_id) {
                return Ok(Some(state));
            }
        }
        match self.ds.get(&ctx_key(context_id)).await? {
            Some(bytes) => {
                let record = CtxRecord::decode(bytes.as_slice())
                    .map_err(|e| EngineError::Store(StoreError::Backend(e.to_string())))?;
                let state = CtxState {
                    metadata: record.metadata,
                    entries: record
                        .entries
                        .as_deref()
                        .map(Cid::try_from)
                        .transpose()
                        .map_err(|e| EngineError::Store(StoreError::Backend(e.to_string())))?,
                    ad: Cid::try_from(record.ad.as_slice())
                        .map_err(|e| EngineError::Store(StoreError::Backend(e.to_string())))?,
                };
                let mut cache = self.ctx_cache.lock().await;
                cache.put(context_id.to_vec(), state.clone());
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Store the signed ad, swap the head and push it out. Must be called
    /// with the publish lock held.
    async fn accept_ad(&self, ad: Advertisement, ctx_update: CtxUpdate) -> Result<Cid, EngineError> {
        let cid = self.links.store(AD_CODEC, &ad.encode()).await?;

        let mut extra = Vec::new();
        match ctx_update {
            CtxUpdate::Set {
                context_id,
                metadata,
                entries,
            } => {
                let record = CtxRecord {
                    metadata: metadata.clone(),
                    entries: entries.map(|c| c.to_bytes()),
                    ad: cid.to_bytes(),
                };
                extra.push(BatchOp::Put {
                    key: ctx_key(&context_id),
                    value: record.encode_to_vec(),
                });
                let mut cache = self.ctx_cache.lock().await;
                cache.put(
                    context_id,
                    CtxState {
                        metadata,
                        entries,
                        ad: cid,
                    },
                );
            }
            CtxUpdate::Remove { context_id } => {
                extra.push(BatchOp::Delete {
                    key: ctx_key(&context_id),
                });
                let mut cache = self.ctx_cache.lock().await;
                cache.remove(&context_id);
            }
            CtxUpdate::None => {}
        }
        self.heads.swap(&cid, extra).await?;
        self.metrics.ad_published();

        let publisher = self.publisher.read().await.clone();
        if let Some(publisher) = publisher {
            publisher.update_head(cid).await?;
        }
        self.announcer.announce(&cid).await;

        debug!("accepted advertisement {}", cid);
        Ok(cid)
    }

    /// Accept a pre-built, already-signed ad (extended-provider flows).
    ///
    /// The ad's `previous_id` must equal the current head, or be absent
    /// when the chain is empty; anything else is a refused fork.
    pub async fn publish(&self, ad: Advertisement) -> Result<Cid, EngineError> {
        self.ensure_running().await?;
        ad.verify_signature()?;

        let _guard = self.publish_lock.lock().await;
        let head = self.heads.head().await?;
        if ad.previous_id != head {
            return Err(EngineError::ChainBroken {
                expected: head,
                got: ad.previous_id,
            });
        }
        self.accept_ad(ad, CtxUpdate::None).await
    }
}

/// What happens to the per-context state record alongside a head swap.
enum CtxUpdate {
    Set {
        context_id: Vec<u8>,
        metadata: Vec<u8>,
        entries: Option<Cid>,
    },
    Remove {
        context_id: Vec<u8>,
    },
    None,
}

#[async_trait]
impl Provider for Engine {
    async fn register_multihash_lister(&self, lister: MultihashLister) {
        let mut slot = self.lister.write().await;
        if slot.is_some() {
            debug!("replacing registered multihash lister");
        }
        *slot = Some(lister);
    }

    async fn notify_put(
        &self,
        provider: Option<ProviderInfo>,
        context_id: &[u8],
        metadata: &[u8],
    ) -> Result<Cid, EngineError> {
        self.ensure_running().await?;
        if context_id.is_empty() {
            return Err(EngineError::EmptyContext);
        }

        let _guard = self.publish_lock.lock().await;

        let prev = self.ctx_state(context_id).await?;
        if let Some(state) = &prev {
            if state.metadata == metadata {
                return Err(EngineError::AlreadyAdvertised(state.ad));
            }
        }

        // Metadata-only updates reuse the previous entries root; fresh
        // contexts materialise entries through the lister.
        let entries = match &prev {
            Some(state) => state.entries,
            None => {
                let lister = self
                    .lister
                    .read()
                    .await
                    .clone()
                    .ok_or(EngineError::NoLister)?;
                let provider_id = provider.as_ref().map(|p| p.id).unwrap_or(self.provider_id);
                let mut iter = lister(provider_id, context_id.to_vec())
                    .await
                    .map_err(|e| match e {
                        ListerError::UnknownContext => EngineError::UnknownContext,
                        other => EngineError::Lister(other),
                    })?;
                write_entries(&self.links, self.chunk_size, iter.as_mut(), &self.metrics).await?
            }
        };

        let (provider_str, addresses) = match &provider {
            Some(info) => (
                info.id.to_string(),
                info.addrs.iter().map(|a| a.to_string()).collect(),
            ),
            None => (self.provider_id.to_string(), self.retrieval_addrs.clone()),
        };

        let mut ad = Advertisement {
            provider: provider_str,
            addresses,
            entries,
            context_id: context_id.to_vec(),
            metadata: metadata.to_vec(),
            is_rm: false,
            previous_id: self.heads.head().await?,
            extended_provider: None,
            signature: Vec::new(),
        };
        ad.sign(&self.key)?;

        self.accept_ad(
            ad,
            CtxUpdate::Set {
                context_id: context_id.to_vec(),
                metadata: metadata.to_vec(),
                entries,
            },
        )
        .await
    }

    async fn notify_remove(
        &self,
        provider: Option<PeerId>,
        context_id: &[u8],
    ) -> Result<Cid, EngineError> {
        self.ensure_running().await?;
        if context_id.is_empty() {
            return Err(EngineError::EmptyContext);
        }

        let _guard = self.publish_lock.lock().await;

        if self.ctx_state(context_id).await?.is_none() {
            return Err(EngineError::UnknownContext);
        }

        let mut ad = Advertisement {
            provider: provider.unwrap_or(self.provider_id).to_string(),
            addresses: self.retrieval_addrs.clone(),
            entries: None,
            context_id: context_id.to_vec(),
            metadata: Vec::new(),
            is_rm: true,
            previous_id: self.heads.head().await?,
            extended_provider: None,
            signature: Vec::new(),
        };
        ad.sign(&self.key)?;

        match self
            .accept_ad(
                ad,
                CtxUpdate::Remove {
                    context_id: context_id.to_vec(),
                },
            )
            .await
        {
            Ok(cid) => Ok(cid),
            Err(err) => {
                warn!("notify_remove failed: {}", err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctx_cache_evicts_oldest() {
        let mut cache = CtxCache::new(2);
        let state = |n: u8| CtxState {
            metadata: vec![n],
            entries: None,
            ad: crate::link::node_cid(AD_CODEC, &[n]).unwrap(),
        };

        cache.put(b"a".to_vec(), state(1));
        cache.put(b"b".to_vec(), state(2));
        // Refresh "a" so "b" becomes the eviction candidate.
        assert!(cache.get(b"a").is_some());
        cache.put(b"c".to_vec(), state(3));

        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"b").is_none());
        assert!(cache.get(b"c").is_some());
    }

    #[test]
    fn test_ctx_cache_remove() {
        let mut cache = CtxCache::new(4);
        cache.put(
            b"a".to_vec(),
            CtxState {
                metadata: Vec::new(),
                entries: None,
                ad: crate::link::node_cid(AD_CODEC, b"x").unwrap(),
            },
        );
        cache.remove(b"a");
        assert!(cache.get(b"a").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_an_error() {
        let engine = Engine::builder().build().unwrap();
        assert!(matches!(engine.shutdown().await, Err(EngineError::NotStarted)));
    }

    #[tokio::test]
    async fn test_notify_put_requires_start() {
        let engine = Engine::builder().build().unwrap();
        let result = engine.notify_put(None, b"ctx", b"meta").await;
        assert!(matches!(result, Err(EngineError::NotStarted)));
    }
}
