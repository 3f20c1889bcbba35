//! Out-of-band head announcements.
//!
//! On every accepted ad the engine POSTs the new head to each configured
//! indexer endpoint. Strictly best-effort: a failed announcement is logged
//! and counted, never retried, and never fails the publish.

use std::time::Duration;

use cid::Cid;
use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::Metrics;

const ANNOUNCE_PATH: &str = "/ingest/announce";
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct AnnounceBody<'a> {
    head: String,
    addrs: &'a [String],
    topic: &'a str,
}

/// Dispatches head announcements to a fixed list of indexer URLs.
pub struct Announcer {
    client: reqwest::Client,
    urls: Vec<String>,
    topic: String,
    addrs: Vec<String>,
    metrics: Metrics,
}

impl Announcer {
    pub fn new(urls: Vec<String>, topic: String, addrs: Vec<String>, metrics: Metrics) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            urls,
            topic,
            addrs,
            metrics,
        }
    }

    /// POST `{head, addrs, topic}` to every configured endpoint.
    pub async fn announce(&self, head: &Cid) {
        if self.urls.is_empty() {
            return;
        }
        let body = AnnounceBody {
            head: head.to_string(),
            addrs: &self.addrs,
            topic: &self.topic,
        };

        for url in &self.urls {
            let endpoint = format!("{}{}", url.trim_end_matches('/'), ANNOUNCE_PATH);
            match self.client.post(&endpoint).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("announced head {} to {}", head, endpoint);
                }
                Ok(resp) => {
                    self.metrics.announce_failure();
                    warn!("announce to {} returned {}", endpoint, resp.status());
                }
                Err(err) => {
                    self.metrics.announce_failure();
                    warn!("announce to {} failed: {}", endpoint, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{node_cid, AD_CODEC};

    #[tokio::test]
    async fn test_announce_with_no_urls_is_a_noop() {
        let metrics = Metrics::new();
        let announcer = Announcer::new(
            Vec::new(),
            "/herald/topic".to_string(),
            vec!["/ip4/127.0.0.1/tcp/4001".to_string()],
            metrics,
        );
        announcer
            .announce(&node_cid(AD_CODEC, b"head").unwrap())
            .await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_logged_not_fatal() {
        let metrics = Metrics::new();
        let announcer = Announcer::new(
            vec!["http://127.0.0.1:1".to_string()],
            "/herald/topic".to_string(),
            Vec::new(),
            metrics.clone(),
        );
        // Must not error or panic.
        announcer
            .announce(&node_cid(AD_CODEC, b"head").unwrap())
            .await;
    }
}
