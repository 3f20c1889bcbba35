//! Content-addressed link system over the datastore.
//!
//! Nodes of the advertisement DAG (ads and entries chunks) are stored as raw
//! blocks keyed by their multihash, so every read is verifiable end to end.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::datastore::{Datastore, StoreError};

/// SHA2-256 multihash code.
/// See: https://github.com/multiformats/multicodec/blob/master/table.csv
pub const SHA256_CODE: u64 = 0x12;

/// Codec for advertisement nodes.
pub const AD_CODEC: u64 = 0xad01;

/// Codec for entries-chunk nodes.
pub const ENTRIES_CODEC: u64 = 0xad02;

const BLOCK_KEY_PREFIX: &[u8] = b"/block/";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("block not found: {0}")]
    NotFound(Cid),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("multihash error: {0}")]
    Multihash(String),

    #[error("datastore error: {0}")]
    Store(#[from] StoreError),
}

/// Compute the CID of a node under the given codec.
pub fn node_cid(codec: u64, bytes: &[u8]) -> Result<Cid, LinkError> {
    let digest = Sha256::digest(bytes);
    let mh = Multihash::wrap(SHA256_CODE, &digest)
        .map_err(|e| LinkError::Multihash(e.to_string()))?;
    Ok(Cid::new_v1(codec, mh))
}

/// Stores and loads DAG nodes as content-addressed blocks.
///
/// Blocks are keyed by multihash, not full CID, so the same bytes reached
/// through different codecs resolve to one stored copy.
#[derive(Clone)]
pub struct LinkSystem {
    ds: Arc<dyn Datastore>,
}

impl LinkSystem {
    pub fn new(ds: Arc<dyn Datastore>) -> Self {
        Self { ds }
    }

    fn block_key(cid: &Cid) -> Vec<u8> {
        let mut key = BLOCK_KEY_PREFIX.to_vec();
        key.extend_from_slice(&cid.hash().to_bytes());
        key
    }

    /// Store a node and return its CID.
    pub async fn store(&self, codec: u64, bytes: &[u8]) -> Result<Cid, LinkError> {
        let cid = node_cid(codec, bytes)?;
        self.ds.put(&Self::block_key(&cid), bytes).await?;
        debug!("stored block {} ({} bytes)", cid, bytes.len());
        Ok(cid)
    }

    /// Load a node, verifying its bytes against the requested CID.
    pub async fn load(&self, cid: &Cid) -> Result<Vec<u8>, LinkError> {
        let bytes = self
            .ds
            .get(&Self::block_key(cid))
            .await?
            .ok_or(LinkError::NotFound(*cid))?;

        let computed = node_cid(cid.codec(), &bytes)?;
        if computed.hash() != cid.hash() {
            return Err(LinkError::HashMismatch {
                expected: cid.to_string(),
                actual: computed.to_string(),
            });
        }
        Ok(bytes)
    }

    pub async fn has(&self, cid: &Cid) -> Result<bool, LinkError> {
        Ok(self.ds.has(&Self::block_key(cid)).await?)
    }
}
