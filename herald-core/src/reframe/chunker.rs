//! Chunk bookkeeping for the reframe listener.
//!
//! Provided CIDs accumulate in the open `current` bucket until it reaches
//! the configured size, at which point it becomes a [`CidsChunk`] addressed
//! by a context ID derived from its contents. Two indexes track flushed
//! chunks: by context ID, and by CID (the last chunk that referenced it).

use std::collections::{BTreeSet, HashMap};

use cid::Cid;
use sha2::{Digest, Sha256};

/// A flushed bucket of CIDs advertised under one context ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CidsChunk {
    pub context_id: Vec<u8>,
    pub cids: BTreeSet<Cid>,
    pub removed: bool,
}

/// Deterministic context ID for a bucket: SHA-256 over the sorted CID
/// bytes, so identical contents produce the same ID across restarts and no
/// duplicate advertisement is ever emitted for a re-derived bucket.
pub(crate) fn generate_context_id(cids: &BTreeSet<Cid>) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for cid in cids {
        hasher.update(cid.to_bytes());
    }
    hasher.finalize().to_vec()
}

pub(crate) struct ChunkIndex {
    by_context: HashMap<Vec<u8>, CidsChunk>,
    /// Last flushed chunk that referenced each CID.
    by_cid: HashMap<Cid, Vec<u8>>,
    current: BTreeSet<Cid>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self {
            by_context: HashMap::new(),
            by_cid: HashMap::new(),
            current: BTreeSet::new(),
        }
    }

    pub fn add_to_current(&mut self, cid: Cid) {
        self.current.insert(cid);
    }

    pub fn remove_from_current(&mut self, cid: &Cid) {
        self.current.remove(cid);
    }

    pub fn current_len(&self) -> usize {
        self.current.len()
    }

    pub fn current_cids(&self) -> &BTreeSet<Cid> {
        &self.current
    }

    /// Close the current bucket into a chunk and index it.
    pub fn take_current(&mut self) -> CidsChunk {
        let cids = std::mem::take(&mut self.current);
        let chunk = CidsChunk {
            context_id: generate_context_id(&cids),
            cids,
            removed: false,
        };
        self.index_chunk(chunk.clone());
        chunk
    }

    /// Index an already-built chunk (flush and re-hydration paths).
    pub fn index_chunk(&mut self, chunk: CidsChunk) {
        for cid in &chunk.cids {
            self.by_cid.insert(*cid, chunk.context_id.clone());
        }
        self.by_context.insert(chunk.context_id.clone(), chunk);
    }

    /// Drop a chunk from both indexes, returning it for the removal ad.
    pub fn remove_chunk(&mut self, context_id: &[u8]) -> Option<CidsChunk> {
        let chunk = self.by_context.remove(context_id)?;
        for cid in &chunk.cids {
            if self.by_cid.get(cid).is_some_and(|ctx| ctx == context_id) {
                self.by_cid.remove(cid);
            }
        }
        Some(chunk)
    }

    pub fn chunk_by_context(&self, context_id: &[u8]) -> Option<&CidsChunk> {
        self.by_context.get(context_id)
    }

    pub fn context_for_cid(&self, cid: &Cid) -> Option<&Vec<u8>> {
        self.by_cid.get(cid)
    }

    pub fn chunk_count(&self) -> usize {
        self.by_context.len()
    }

    /// Remove every flushed chunk, returning them. Used when collapsing
    /// into a snapshot.
    pub fn drain_chunks(&mut self) -> Vec<CidsChunk> {
        self.by_cid.clear();
        self.by_context.drain().map(|(_, chunk)| chunk).collect()
    }
}
