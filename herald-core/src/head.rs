//! Ad chain head tracking.
//!
//! The head CID is the single mutable piece of chain state. Swaps go through
//! an atomic datastore batch together with whatever context-state writes
//! belong to the same publish, so a crash can never separate the two.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cid::Cid;
use libp2p::identity::{Keypair, PeerId, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ad::AdError;
use crate::datastore::{BatchOp, Datastore, StoreError};

pub const HEAD_KEY: &[u8] = b"/ad/head";

const HEAD_SIGNATURE_DOMAIN: &[u8] = b"/herald/head-signature";

/// Reads and swaps the current head CID.
#[derive(Clone)]
pub struct HeadStore {
    ds: Arc<dyn Datastore>,
}

impl HeadStore {
    pub fn new(ds: Arc<dyn Datastore>) -> Self {
        Self { ds }
    }

    pub async fn head(&self) -> Result<Option<Cid>, StoreError> {
        match self.ds.get(HEAD_KEY).await? {
            Some(bytes) => {
                let cid = Cid::try_from(bytes.as_slice())
                    .map_err(|e| StoreError::Backend(format!("corrupt head: {e}")))?;
                Ok(Some(cid))
            }
            None => Ok(None),
        }
    }

    /// Atomically advance the head, applying `extra` in the same batch.
    pub async fn swap(&self, head: &Cid, mut extra: Vec<BatchOp>) -> Result<(), StoreError> {
        extra.push(BatchOp::Put {
            key: HEAD_KEY.to_vec(),
            value: head.to_bytes(),
        });
        self.ds.batch(extra).await
    }
}

/// The record served at `GET /head`: the head CID bound to the publishing
/// topic under the provider key, so pollers can authenticate what they got.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedHead {
    /// Head CID in its canonical string form (base32 for CIDv1).
    pub head: String,
    pub topic: String,
    /// Base64 protobuf-encoded public key of the signer.
    pub pubkey: String,
    /// Base64 signature over the domain-tagged digest of `head || topic`.
    pub sig: String,
}

fn head_digest(head: &Cid, topic: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(HEAD_SIGNATURE_DOMAIN);
    hasher.update(head.to_bytes());
    hasher.update(topic.as_bytes());
    hasher.finalize().into()
}

impl SignedHead {
    pub fn sign(head: &Cid, topic: &str, key: &Keypair) -> Result<Self, AdError> {
        let digest = head_digest(head, topic);
        let sig = key
            .sign(&digest)
            .map_err(|e| AdError::Signing(e.to_string()))?;
        Ok(Self {
            head: head.to_string(),
            topic: topic.to_string(),
            pubkey: BASE64.encode(key.public().encode_protobuf()),
            sig: BASE64.encode(sig),
        })
    }

    /// Verify the record and return the head CID and the signer's peer ID.
    pub fn verify(&self) -> Result<(Cid, PeerId), AdError> {
        let head: Cid = self
            .head
            .parse()
            .map_err(|e| AdError::InvalidCid(format!("{e}")))?;
        let pubkey_bytes = BASE64
            .decode(&self.pubkey)
            .map_err(|_| AdError::BadSignature)?;
        let sig = BASE64.decode(&self.sig).map_err(|_| AdError::BadSignature)?;
        let public_key =
            PublicKey::try_decode_protobuf(&pubkey_bytes).map_err(|_| AdError::BadSignature)?;

        if !public_key.verify(&head_digest(&head, &self.topic), &sig) {
            return Err(AdError::BadSignature);
        }
        Ok((head, PeerId::from_public_key(&public_key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;
    use crate::link::{node_cid, AD_CODEC};

    #[tokio::test]
    async fn test_head_starts_empty() {
        let heads = HeadStore::new(MemDatastore::shared());
        assert_eq!(heads.head().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_swap_and_read_back() {
        let heads = HeadStore::new(MemDatastore::shared());
        let cid = node_cid(AD_CODEC, b"genesis").unwrap();

        heads.swap(&cid, Vec::new()).await.unwrap();
        assert_eq!(heads.head().await.unwrap(), Some(cid));

        let newer = node_cid(AD_CODEC, b"second").unwrap();
        heads.swap(&newer, Vec::new()).await.unwrap();
        assert_eq!(heads.head().await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_swap_applies_extra_ops_atomically() {
        let ds = MemDatastore::shared();
        let heads = HeadStore::new(Arc::clone(&ds));
        let cid = node_cid(AD_CODEC, b"ad").unwrap();

        heads
            .swap(
                &cid,
                vec![BatchOp::Put {
                    key: b"/ad/ctx/fish".to_vec(),
                    value: b"state".to_vec(),
                }],
            )
            .await
            .unwrap();

        assert!(ds.has(b"/ad/ctx/fish").await.unwrap());
        assert_eq!(heads.head().await.unwrap(), Some(cid));
    }

    #[test]
    fn test_signed_head_roundtrip() {
        let key = Keypair::generate_ed25519();
        let cid = node_cid(AD_CODEC, b"head").unwrap();

        let signed = SignedHead::sign(&cid, "/herald/topic", &key).unwrap();
        let (got_head, signer) = signed.verify().unwrap();
        assert_eq!(got_head, cid);
        assert_eq!(signer, PeerId::from(key.public()));
    }

    #[test]
    fn test_signed_head_rejects_topic_swap() {
        let key = Keypair::generate_ed25519();
        let cid = node_cid(AD_CODEC, b"head").unwrap();

        let mut signed = SignedHead::sign(&cid, "/herald/topic", &key).unwrap();
        signed.topic = "/other/topic".to_string();
        assert!(signed.verify().is_err());
    }
}
