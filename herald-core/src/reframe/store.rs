//! Persistence for reframe state.
//!
//! Wraps the datastore with the `/reframe/*` key namespace: one record per
//! flushed chunk, one timestamp per queued CID, and numbered snapshot
//! records. Records are protobuf, like every other wire structure in the
//! node.

use std::collections::BTreeSet;
use std::sync::Arc;

use cid::Cid;
use prost::Message as ProstMessage;

use super::chunker::CidsChunk;
use super::ReframeError;
use crate::datastore::{BatchOp, Datastore};

const CHUNK_PREFIX: &[u8] = b"/reframe/chunk/";
const TS_PREFIX: &[u8] = b"/reframe/ts/";
const SNAPSHOT_PREFIX: &[u8] = b"/reframe/snapshot/";

#[derive(Clone, PartialEq, prost::Message)]
struct ChunkRecord {
    #[prost(bytes = "vec", tag = "1")]
    context_id: Vec<u8>,

    #[prost(bytes = "vec", repeated, tag = "2")]
    cids: Vec<Vec<u8>>,

    #[prost(bool, tag = "3")]
    removed: bool,
}

/// On-disk snapshot: the open current bucket plus the context IDs of every
/// chunk that was persisted when the snapshot was taken.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct SnapshotRecord {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub current_cids: Vec<Vec<u8>>,

    #[prost(bytes = "vec", repeated, tag = "2")]
    pub flushed_context_ids: Vec<Vec<u8>>,
}

fn chunk_key(context_id: &[u8]) -> Vec<u8> {
    let mut key = CHUNK_PREFIX.to_vec();
    key.extend_from_slice(hex::encode(context_id).as_bytes());
    key
}

fn ts_key(cid: &Cid) -> Vec<u8> {
    let mut key = TS_PREFIX.to_vec();
    key.extend_from_slice(cid.to_string().as_bytes());
    key
}

fn snapshot_key(index: u64) -> Vec<u8> {
    let mut key = SNAPSHOT_PREFIX.to_vec();
    key.extend_from_slice(format!("{index:020}").as_bytes());
    key
}

fn record_from_chunk(chunk: &CidsChunk) -> ChunkRecord {
    ChunkRecord {
        context_id: chunk.context_id.clone(),
        cids: chunk.cids.iter().map(|c| c.to_bytes()).collect(),
        removed: chunk.removed,
    }
}

fn chunk_from_record(record: ChunkRecord) -> Result<CidsChunk, ReframeError> {
    let mut cids = BTreeSet::new();
    for bytes in &record.cids {
        let cid = Cid::try_from(bytes.as_slice())
            .map_err(|e| ReframeError::InvalidCid(e.to_string()))?;
        cids.insert(cid);
    }
    Ok(CidsChunk {
        context_id: record.context_id,
        cids,
        removed: record.removed,
    })
}

#[derive(Clone)]
pub(crate) struct DsWrapper {
    ds: Arc<dyn Datastore>,
}

impl DsWrapper {
    pub fn new(ds: Arc<dyn Datastore>) -> Self {
        Self { ds }
    }

    pub async fn put_chunk(&self, chunk: &CidsChunk) -> Result<(), ReframeError> {
        let record = record_from_chunk(chunk);
        self.ds
            .put(&chunk_key(&chunk.context_id), &record.encode_to_vec())
            .await?;
        Ok(())
    }

    pub async fn get_chunk(&self, context_id: &[u8]) -> Result<Option<CidsChunk>, ReframeError> {
        match self.ds.get(&chunk_key(context_id)).await? {
            Some(bytes) => {
                let record = ChunkRecord::decode(bytes.as_slice())?;
                Ok(Some(chunk_from_record(record)?))
            }
            None => Ok(None),
        }
    }

    /// All persisted chunk records, tombstones included.
    pub async fn list_chunks(&self) -> Result<Vec<CidsChunk>, ReframeError> {
        let mut chunks = Vec::new();
        for (_, bytes) in self.ds.query(CHUNK_PREFIX).await? {
            let record = ChunkRecord::decode(bytes.as_slice())?;
            chunks.push(chunk_from_record(record)?);
        }
        Ok(chunks)
    }

    /// Rewrite a chunk record with the removed tombstone set, so restarts
    /// know this bucket was retracted.
    pub async fn mark_chunk_removed(&self, chunk: &CidsChunk) -> Result<(), ReframeError> {
        let mut tombstone = chunk.clone();
        tombstone.removed = true;
        self.put_chunk(&tombstone).await
    }

    pub async fn delete_chunk(&self, context_id: &[u8]) -> Result<(), ReframeError> {
        self.ds.delete(&chunk_key(context_id)).await?;
        Ok(())
    }

    pub async fn put_timestamp(&self, cid: &Cid, timestamp_ms: u64) -> Result<(), ReframeError> {
        self.ds
            .put(&ts_key(cid), &timestamp_ms.to_be_bytes())
            .await?;
        Ok(())
    }

    pub async fn delete_timestamps(&self, cids: &[Cid]) -> Result<(), ReframeError> {
        let ops = cids
            .iter()
            .map(|c| BatchOp::Delete { key: ts_key(c) })
            .collect();
        self.ds.batch(ops).await?;
        Ok(())
    }

    /// All `(cid, timestamp)` pairs on disk.
    pub async fn list_timestamps(&self) -> Result<Vec<(Cid, u64)>, ReframeError> {
        let mut out = Vec::new();
        for (key, bytes) in self.ds.query(TS_PREFIX).await? {
            let cid_str = std::str::from_utf8(&key[TS_PREFIX.len()..])
                .map_err(|e| ReframeError::InvalidCid(e.to_string()))?;
            let cid: Cid = cid_str
                .parse()
                .map_err(|e: cid::Error| ReframeError::InvalidCid(e.to_string()))?;
            let arr: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| ReframeError::InvalidCid("bad timestamp record".to_string()))?;
            out.push((cid, u64::from_be_bytes(arr)));
        }
        Ok(out)
    }

    pub async fn snapshot_count(&self) -> Result<u64, ReframeError> {
        Ok(self.ds.query(SNAPSHOT_PREFIX).await?.len() as u64)
    }

    pub async fn put_snapshot(&self, record: &SnapshotRecord) -> Result<(), ReframeError> {
        let index = self.snapshot_count().await?;
        self.ds
            .put(&snapshot_key(index), &record.encode_to_vec())
            .await?;
        Ok(())
    }

    pub async fn latest_snapshot(&self) -> Result<Option<SnapshotRecord>, ReframeError> {
        let mut snapshots = self.ds.query(SNAPSHOT_PREFIX).await?;
        match snapshots.pop() {
            Some((_, bytes)) => Ok(Some(SnapshotRecord::decode(bytes.as_slice())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;
    use crate::link::{node_cid, ENTRIES_CODEC};
    use crate::reframe::chunker::generate_context_id;

    fn cid(n: u8) -> Cid {
        node_cid(ENTRIES_CODEC, &[n]).unwrap()
    }

    fn chunk(ns: &[u8]) -> CidsChunk {
        let cids: BTreeSet<Cid> = ns.iter().map(|&n| cid(n)).collect();
        CidsChunk {
            context_id: generate_context_id(&cids),
            cids,
            removed: false,
        }
    }

    #[tokio::test]
    async fn test_chunk_roundtrip() {
        let store = DsWrapper::new(MemDatastore::shared());
        let chunk = chunk(&[1, 2, 3]);

        store.put_chunk(&chunk).await.unwrap();
        let loaded = store.get_chunk(&chunk.context_id).await.unwrap().unwrap();
        assert_eq!(loaded, chunk);
        assert!(store.get_chunk(b"missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_chunk_removed_persists_tombstone() {
        let store = DsWrapper::new(MemDatastore::shared());
        let chunk = chunk(&[1]);
        store.put_chunk(&chunk).await.unwrap();

        store.mark_chunk_removed(&chunk).await.unwrap();
        let loaded = store.get_chunk(&chunk.context_id).await.unwrap().unwrap();
        assert!(loaded.removed);
    }

    #[tokio::test]
    async fn test_timestamps_roundtrip_and_listing() {
        let store = DsWrapper::new(MemDatastore::shared());
        store.put_timestamp(&cid(1), 111).await.unwrap();
        store.put_timestamp(&cid(2), 222).await.unwrap();

        let mut all = store.list_timestamps().await.unwrap();
        all.sort_by_key(|(_, ts)| *ts);
        assert_eq!(all, vec![(cid(1), 111), (cid(2), 222)]);

        // Overwriting refreshes in place rather than adding a record.
        store.put_timestamp(&cid(2), 333).await.unwrap();
        let all = store.list_timestamps().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&(cid(2), 333)));

        store.delete_timestamps(&[cid(1)]).await.unwrap();
        let all = store.list_timestamps().await.unwrap();
        assert_eq!(all, vec![(cid(2), 333)]);
    }

    #[tokio::test]
    async fn test_snapshots_are_numbered_and_latest_wins() {
        let store = DsWrapper::new(MemDatastore::shared());
        assert!(store.latest_snapshot().await.unwrap().is_none());

        store
            .put_snapshot(&SnapshotRecord {
                current_cids: vec![cid(1).to_bytes()],
                flushed_context_ids: Vec::new(),
            })
            .await
            .unwrap();
        store
            .put_snapshot(&SnapshotRecord {
                current_cids: vec![cid(2).to_bytes()],
                flushed_context_ids: vec![b"ctx".to_vec()],
            })
            .await
            .unwrap();

        assert_eq!(store.snapshot_count().await.unwrap(), 2);
        let latest = store.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.current_cids, vec![cid(2).to_bytes()]);
    }
}
