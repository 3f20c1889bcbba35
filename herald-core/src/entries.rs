//! Entry chunker: multihash iterator → back-linked chunk chain.
//!
//! Multihashes accumulate into fixed-size pages; each page is stored through
//! the link system with `next` pointing at the previously written page. The
//! returned root is the CID of the *last* page built, so walking root →
//! `next == None` yields the whole batch newest-first. Indexers rely only on
//! set semantics, not on the order.

use cid::Cid;
use multihash::Multihash;
use thiserror::Error;
use tracing::debug;

use crate::ad::EntriesChunk;
use crate::link::{LinkError, LinkSystem, ENTRIES_CODEC};
use crate::lister::{ListerError, MultihashIterator};
use crate::metrics::Metrics;

/// Default number of multihashes per entries chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("iterator failed: {0}")]
    Iterator(#[from] ListerError),

    #[error("link system error: {0}")]
    Link(#[from] LinkError),
}

/// Writes the multihashes yielded by `iter` as a chain of entries chunks.
///
/// Returns the root (newest) chunk CID, or `None` when the iterator yields
/// nothing. On iterator failure the build aborts; chunks already written
/// stay in the block store, unreferenced and harmless.
pub async fn write_entries(
    links: &LinkSystem,
    chunk_size: usize,
    iter: &mut dyn MultihashIterator,
    metrics: &Metrics,
) -> Result<Option<Cid>, ChunkerError> {
    assert!(chunk_size > 0, "chunk_size must be greater than 0");

    let mut buffer: Vec<Multihash<64>> = Vec::with_capacity(chunk_size);
    let mut prev: Option<Cid> = None;
    let mut total = 0usize;

    loop {
        match iter.next()? {
            Some(mh) => {
                buffer.push(mh);
                total += 1;
                if buffer.len() == chunk_size {
                    prev = Some(flush_chunk(links, &mut buffer, prev, metrics).await?);
                }
            }
            None => break,
        }
    }

    if !buffer.is_empty() {
        prev = Some(flush_chunk(links, &mut buffer, prev, metrics).await?);
    }

    debug!("wrote {} multihashes, entries root {:?}", total, prev);
    Ok(prev)
}

async fn flush_chunk(
    links: &LinkSystem,
    buffer: &mut Vec<Multihash<64>>,
    next: Option<Cid>,
    metrics: &Metrics,
) -> Result<Cid, ChunkerError> {
    let chunk = EntriesChunk {
        entries: std::mem::take(buffer),
        next,
    };
    let cid = links.store(ENTRIES_CODEC, &chunk.encode()).await?;
    metrics.entries_chunk_written(chunk.entries.len() as u64);
    Ok(cid)
}

/// Walk a chunk chain from its root, collecting every multihash.
///
/// Used by tests and by the sync server when re-serving entries.
pub async fn read_entries(
    links: &LinkSystem,
    root: &Cid,
) -> Result<Vec<Multihash<64>>, ChunkerError> {
    let mut out = Vec::new();
    let mut cursor = Some(*root);
    while let Some(cid) = cursor {
        let bytes = links.load(&cid).await?;
        let chunk = EntriesChunk::decode(&bytes)
            .map_err(|e| ChunkerError::Iterator(ListerError::Failed(e.to_string())))?;
        out.extend(chunk.entries);
        cursor = chunk.next;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;
    use crate::lister::VecIterator;
    use sha2::{Digest, Sha256};
    use std::collections::HashSet;

    fn mhs(n: usize) -> Vec<Multihash<64>> {
        (0..n)
            .map(|i| {
                let digest = Sha256::digest(i.to_be_bytes());
                Multihash::wrap(crate::link::SHA256_CODE, &digest).unwrap()
            })
            .collect()
    }

    struct FailingIterator {
        yielded: usize,
        fail_after: usize,
    }

    impl MultihashIterator for FailingIterator {
        fn next(&mut self) -> Result<Option<Multihash<64>>, ListerError> {
            if self.yielded >= self.fail_after {
                return Err(ListerError::Failed("lobster".to_string()));
            }
            self.yielded += 1;
            Ok(Some(mhs(self.yielded)[self.yielded - 1]))
        }
    }

    #[tokio::test]
    async fn test_empty_iterator_yields_no_root() {
        let links = LinkSystem::new(MemDatastore::shared());
        let mut iter = VecIterator::new(Vec::new());

        let root = write_entries(&links, 4, &mut iter, &Metrics::new()).await.unwrap();
        assert_eq!(root, None);
    }

    #[tokio::test]
    async fn test_single_partial_chunk() {
        let links = LinkSystem::new(MemDatastore::shared());
        let input = mhs(3);
        let mut iter = VecIterator::new(input.clone());

        let root = write_entries(&links, 8, &mut iter, &Metrics::new()).await.unwrap().unwrap();
        let chunk = EntriesChunk::decode(&links.load(&root).await.unwrap()).unwrap();
        assert_eq!(chunk.entries, input);
        assert_eq!(chunk.next, None);
    }

    #[tokio::test]
    async fn test_chain_links_newest_to_oldest() {
        let links = LinkSystem::new(MemDatastore::shared());
        let input = mhs(10);
        let mut iter = VecIterator::new(input.clone());

        let metrics = Metrics::new();
        let root = write_entries(&links, 4, &mut iter, &metrics)
            .await
            .unwrap()
            .unwrap();

        // Three pages written, ten multihashes counted.
        assert!(metrics.render().contains("herald_entries_chunks_written 3"));
        assert!(metrics.render().contains("herald_mhs_advertised 10"));

        // 10 entries at chunk size 4: pages of 4, 4, 2; root holds the last 2.
        let newest = EntriesChunk::decode(&links.load(&root).await.unwrap()).unwrap();
        assert_eq!(newest.entries.len(), 2);
        assert!(newest.next.is_some());

        let middle =
            EntriesChunk::decode(&links.load(&newest.next.unwrap()).await.unwrap()).unwrap();
        assert_eq!(middle.entries.len(), 4);

        let oldest =
            EntriesChunk::decode(&links.load(&middle.next.unwrap()).await.unwrap()).unwrap();
        assert_eq!(oldest.entries.len(), 4);
        assert_eq!(oldest.next, None);
    }

    #[tokio::test]
    async fn test_announced_set_equals_lister_set() {
        let links = LinkSystem::new(MemDatastore::shared());
        let input = mhs(100);
        let mut iter = VecIterator::new(input.clone());

        let root = write_entries(&links, 7, &mut iter, &Metrics::new()).await.unwrap().unwrap();
        let walked = read_entries(&links, &root).await.unwrap();

        let want: HashSet<_> = input.into_iter().collect();
        let got: HashSet<_> = walked.into_iter().collect();
        assert_eq!(want, got);
    }

    #[tokio::test]
    async fn test_exact_chunk_boundary() {
        let links = LinkSystem::new(MemDatastore::shared());
        let input = mhs(8);
        let mut iter = VecIterator::new(input);

        let root = write_entries(&links, 4, &mut iter, &Metrics::new()).await.unwrap().unwrap();
        let newest = EntriesChunk::decode(&links.load(&root).await.unwrap()).unwrap();
        // No trailing empty page: the newest page is full.
        assert_eq!(newest.entries.len(), 4);
    }

    #[tokio::test]
    async fn test_iterator_error_aborts_build() {
        let links = LinkSystem::new(MemDatastore::shared());
        let mut iter = FailingIterator {
            yielded: 0,
            fail_after: 6,
        };

        let result = write_entries(&links, 4, &mut iter, &Metrics::new()).await;
        assert!(matches!(result, Err(ChunkerError::Iterator(_))));
    }

    #[tokio::test]
    async fn test_same_input_same_root() {
        let links = LinkSystem::new(MemDatastore::shared());
        let input = mhs(20);

        let mut iter1 = VecIterator::new(input.clone());
        let root1 = write_entries(&links, 5, &mut iter1, &Metrics::new()).await.unwrap();
        let mut iter2 = VecIterator::new(input);
        let root2 = write_entries(&links, 5, &mut iter2, &Metrics::new()).await.unwrap();

        assert_eq!(root1, root2);
    }
}
