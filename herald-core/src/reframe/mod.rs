//! Reframe chunker/listener: high-throughput live-provide ingestion.
//!
//! Streaming `provide(cid)` calls are deduplicated, timestamped and bucketed
//! into fixed-size chunks. Each full chunk is advertised through the engine
//! under a context ID derived deterministically from its contents; CIDs that
//! outlive their TTL retract the chunks that referenced them. State is
//! persisted so a restart resumes where the node left off.

mod chunker;
mod listener;
mod queue;
mod store;

pub use listener::ReframeListener;

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::datastore::StoreError;
use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum ReframeError {
    #[error("datastore error: {0}")]
    Store(#[from] StoreError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("corrupt reframe record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid cid in reframe record: {0}")]
    InvalidCid(String),
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
