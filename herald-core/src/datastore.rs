//! Byte-keyed key-value store used for advertisements, chain state and
//! reframe bookkeeping.
//!
//! The engine only ever consumes the [`Datastore`] trait; the in-memory
//! implementation here is the default and is what the test suites run
//! against. Production deployments can plug any store that offers atomic
//! batch writes and ordered prefix queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("datastore failure: {0}")]
    Backend(String),
}

/// A single operation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Opaque byte-keyed persistence consumed by the engine.
///
/// Implementations must apply [`Datastore::batch`] atomically: either every
/// operation in the batch becomes visible or none does.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    async fn has(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Return all `(key, value)` pairs whose key starts with `prefix`,
    /// ordered by key.
    async fn query(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;
}

/// In-memory datastore backed by an ordered map.
pub struct MemDatastore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Convenience constructor for the common `Arc<dyn Datastore>` shape.
    pub fn shared() -> Arc<dyn Datastore> {
        Arc::new(Self::new())
    }
}

impl Default for MemDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.inner.read().await;
        Ok(map.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.inner.write().await;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self.inner.write().await;
        map.remove(key);
        Ok(())
    }

    async fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        let map = self.inner.read().await;
        Ok(map.contains_key(key))
    }

    async fn query(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map = self.inner.read().await;
        let pairs = map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(pairs)
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        // A single write-lock scope makes the batch atomic with respect to
        // every other accessor.
        let mut map = self.inner.write().await;
        debug!("applying batch of {} ops", ops.len());
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let ds = MemDatastore::new();
        ds.put(b"/a", b"one").await.unwrap();

        assert_eq!(ds.get(b"/a").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(ds.get(b"/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_has_and_delete() {
        let ds = MemDatastore::new();
        ds.put(b"/a", b"one").await.unwrap();

        assert!(ds.has(b"/a").await.unwrap());
        ds.delete(b"/a").await.unwrap();
        assert!(!ds.has(b"/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_returns_only_prefix_matches_in_order() {
        let ds = MemDatastore::new();
        ds.put(b"/chunk/2", b"b").await.unwrap();
        ds.put(b"/chunk/1", b"a").await.unwrap();
        ds.put(b"/other/1", b"x").await.unwrap();

        let pairs = ds.query(b"/chunk/").await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, b"/chunk/1".to_vec());
        assert_eq!(pairs[1].0, b"/chunk/2".to_vec());
    }

    #[tokio::test]
    async fn test_batch_applies_all_ops() {
        let ds = MemDatastore::new();
        ds.put(b"/old", b"gone").await.unwrap();

        ds.batch(vec![
            BatchOp::Put {
                key: b"/new".to_vec(),
                value: b"here".to_vec(),
            },
            BatchOp::Delete {
                key: b"/old".to_vec(),
            },
        ])
        .await
        .unwrap();

        assert!(ds.has(b"/new").await.unwrap());
        assert!(!ds.has(b"/old").await.unwrap());
    }
}
