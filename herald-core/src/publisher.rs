//! Publication transport seam.
//!
//! The engine talks to its transport through one narrow contract: push the
//! new head. Which transport backs it is decided once, at construction, and
//! never changes for the life of the engine.

use async_trait::async_trait;
use cid::Cid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher is not running")]
    NotRunning,

    #[error("gossip publish failed: {0}")]
    Gossip(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link system error: {0}")]
    Link(#[from] crate::link::LinkError),

    #[error("signing error: {0}")]
    Ad(#[from] crate::ad::AdError),
}

/// Which transport serves the advertisement DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    /// Gossip announce plus peer-to-peer pull channel.
    DtSync,
    /// Static HTTP tree, polled by indexers.
    Http,
}

impl std::str::FromStr for PublisherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dtsync" => Ok(Self::DtSync),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown publisher kind: {other}")),
        }
    }
}

/// Narrow transport contract invoked by the engine on every accepted ad.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Make `head` the advertised chain head.
    async fn update_head(&self, head: Cid) -> Result<(), PublishError>;

    /// Stop serving. Idempotent.
    async fn shutdown(&self) -> Result<(), PublishError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_kind_parses() {
        assert_eq!("dtsync".parse::<PublisherKind>().unwrap(), PublisherKind::DtSync);
        assert_eq!("http".parse::<PublisherKind>().unwrap(), PublisherKind::Http);
        assert!("carrier-pigeon".parse::<PublisherKind>().is_err());
    }
}
