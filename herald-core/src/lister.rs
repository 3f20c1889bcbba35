//! Multihash lister indirection.
//!
//! The engine never buffers the multihashes of an advertisement. Instead the
//! caller registers a single lister callback that, given a provider and a
//! context ID, produces a fresh iterator over that context's multihashes.
//! Restartability comes from re-invoking the lister, so publication can
//! re-walk entries at any time.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use libp2p::identity::PeerId;
use multihash::Multihash;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum ListerError {
    #[error("unknown context")]
    UnknownContext,

    #[error("no lister registered")]
    NoLister,

    #[error("lister failed: {0}")]
    Failed(String),
}

/// Yields multihashes until exhausted (`Ok(None)`) or failed.
pub trait MultihashIterator: Send {
    fn next(&mut self) -> Result<Option<Multihash<64>>, ListerError>;
}

/// Caller-supplied callback resolving `(provider, context-id)` to a fresh
/// multihash iterator.
pub type MultihashLister = Arc<
    dyn Fn(PeerId, Vec<u8>) -> BoxFuture<'static, Result<Box<dyn MultihashIterator>, ListerError>>
        + Send
        + Sync,
>;

/// Iterator over an in-memory multihash list.
pub struct VecIterator {
    mhs: Vec<Multihash<64>>,
    pos: usize,
}

impl VecIterator {
    pub fn new(mhs: Vec<Multihash<64>>) -> Self {
        Self { mhs, pos: 0 }
    }
}

impl MultihashIterator for VecIterator {
    fn next(&mut self) -> Result<Option<Multihash<64>>, ListerError> {
        if self.pos >= self.mhs.len() {
            return Ok(None);
        }
        let mh = self.mhs[self.pos];
        self.pos += 1;
        Ok(Some(mh))
    }
}

/// Explicit context-id → multihash store, owned by whoever registers it.
///
/// Replaces the process-wide map the admin tester used to lean on: each
/// instance is injected where needed and nothing is global.
#[derive(Default)]
pub struct MhStore {
    inner: RwLock<HashMap<Vec<u8>, Vec<Multihash<64>>>>,
}

impl MhStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put(&self, context_id: &[u8], mhs: Vec<Multihash<64>>) {
        let mut map = self.inner.write().await;
        map.insert(context_id.to_vec(), mhs);
    }

    pub async fn remove(&self, context_id: &[u8]) {
        let mut map = self.inner.write().await;
        map.remove(context_id);
    }

    pub async fn get(&self, context_id: &[u8]) -> Option<Vec<Multihash<64>>> {
        let map = self.inner.read().await;
        map.get(context_id).cloned()
    }

    /// A lister backed by this store.
    pub fn lister(self: &Arc<Self>) -> MultihashLister {
        let store = Arc::clone(self);
        Arc::new(move |_provider, context_id| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                let mhs = store
                    .get(&context_id)
                    .await
                    .ok_or(ListerError::UnknownContext)?;
                Ok(Box::new(VecIterator::new(mhs)) as Box<dyn MultihashIterator>)
            })
        })
    }
}
