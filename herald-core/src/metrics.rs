//! Node metrics.
//!
//! Thread-safe counters using atomic types, rendered as Prometheus text by
//! the HTTP publisher's `/metrics` route.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector for a herald node.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Advertisement chain metrics
    ads_published: AtomicU64,
    entries_chunks_written: AtomicU64,
    mhs_advertised: AtomicU64,

    // Reframe ingestion metrics
    provides: AtomicU64,
    provides_deduped: AtomicU64,
    cids_expired: AtomicU64,
    chunks_flushed: AtomicU64,
    snapshots_taken: AtomicU64,

    // Transport metrics
    blocks_served: AtomicU64,
    head_requests: AtomicU64,
    announce_failures: AtomicU64,

    start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                ads_published: AtomicU64::new(0),
                entries_chunks_written: AtomicU64::new(0),
                mhs_advertised: AtomicU64::new(0),
                provides: AtomicU64::new(0),
                provides_deduped: AtomicU64::new(0),
                cids_expired: AtomicU64::new(0),
                chunks_flushed: AtomicU64::new(0),
                snapshots_taken: AtomicU64::new(0),
                blocks_served: AtomicU64::new(0),
                head_requests: AtomicU64::new(0),
                announce_failures: AtomicU64::new(0),
                start_time: SystemTime::now(),
            }),
        }
    }

    pub fn ad_published(&self) {
        self.inner.ads_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entries_chunk_written(&self, mhs: u64) {
        self.inner
            .entries_chunks_written
            .fetch_add(1, Ordering::Relaxed);
        self.inner.mhs_advertised.fetch_add(mhs, Ordering::Relaxed);
    }

    pub fn provide(&self, deduped: bool) {
        self.inner.provides.fetch_add(1, Ordering::Relaxed);
        if deduped {
            self.inner.provides_deduped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cids_expired(&self, count: u64) {
        self.inner.cids_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn chunk_flushed(&self) {
        self.inner.chunks_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_taken(&self) {
        self.inner.snapshots_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_served(&self) {
        self.inner.blocks_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn head_request(&self) {
        self.inner.head_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn announce_failure(&self) {
        self.inner.announce_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ads_published(&self) -> u64 {
        self.inner.ads_published.load(Ordering::Relaxed)
    }

    pub fn provides(&self) -> u64 {
        self.inner.provides.load(Ordering::Relaxed)
    }

    pub fn chunks_flushed(&self) -> u64 {
        self.inner.chunks_flushed.load(Ordering::Relaxed)
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.inner.snapshots_taken.load(Ordering::Relaxed)
    }

    /// Render all counters in Prometheus text format.
    pub fn render(&self) -> String {
        let uptime = SystemTime::now()
            .duration_since(self.inner.start_time)
            .unwrap_or_default()
            .as_secs();
        let started = self
            .inner
            .start_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        format!(
            "# HELP herald_ads_published Advertisements accepted onto the chain\n\
             # TYPE herald_ads_published counter\n\
             herald_ads_published {}\n\
             # HELP herald_entries_chunks_written Entries chunks written\n\
             # TYPE herald_entries_chunks_written counter\n\
             herald_entries_chunks_written {}\n\
             # HELP herald_mhs_advertised Multihashes advertised\n\
             # TYPE herald_mhs_advertised counter\n\
             herald_mhs_advertised {}\n\
             # HELP herald_provides Provide calls received\n\
             # TYPE herald_provides counter\n\
             herald_provides {}\n\
             # HELP herald_provides_deduped Provide calls that only refreshed a timestamp\n\
             # TYPE herald_provides_deduped counter\n\
             herald_provides_deduped {}\n\
             # HELP herald_cids_expired CIDs evicted past their TTL\n\
             # TYPE herald_cids_expired counter\n\
             herald_cids_expired {}\n\
             # HELP herald_chunks_flushed Reframe chunks advertised\n\
             # TYPE herald_chunks_flushed counter\n\
             herald_chunks_flushed {}\n\
             # HELP herald_snapshots_taken Reframe snapshots taken\n\
             # TYPE herald_snapshots_taken counter\n\
             herald_snapshots_taken {}\n\
             # HELP herald_blocks_served DAG blocks served to syncers\n\
             # TYPE herald_blocks_served counter\n\
             herald_blocks_served {}\n\
             # HELP herald_head_requests Head lookups served\n\
             # TYPE herald_head_requests counter\n\
             herald_head_requests {}\n\
             # HELP herald_announce_failures Direct announcements that failed\n\
             # TYPE herald_announce_failures counter\n\
             herald_announce_failures {}\n\
             # HELP herald_start_time_seconds Unix time the node started\n\
             # TYPE herald_start_time_seconds gauge\n\
             herald_start_time_seconds {}\n\
             # HELP herald_uptime_seconds Seconds since the node started\n\
             # TYPE herald_uptime_seconds counter\n\
             herald_uptime_seconds {}\n",
            self.inner.ads_published.load(Ordering::Relaxed),
            self.inner.entries_chunks_written.load(Ordering::Relaxed),
            self.inner.mhs_advertised.load(Ordering::Relaxed),
            self.inner.provides.load(Ordering::Relaxed),
            self.inner.provides_deduped.load(Ordering::Relaxed),
            self.inner.cids_expired.load(Ordering::Relaxed),
            self.inner.chunks_flushed.load(Ordering::Relaxed),
            self.inner.snapshots_taken.load(Ordering::Relaxed),
            self.inner.blocks_served.load(Ordering::Relaxed),
            self.inner.head_requests.load(Ordering::Relaxed),
            self.inner.announce_failures.load(Ordering::Relaxed),
            started,
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.ad_published();
        metrics.ad_published();
        metrics.provide(false);
        metrics.provide(true);

        assert_eq!(metrics.ads_published(), 2);
        assert_eq!(metrics.provides(), 2);
    }

    #[test]
    fn test_render_contains_counter_lines() {
        let metrics = Metrics::new();
        metrics.chunk_flushed();

        let text = metrics.render();
        assert!(text.contains("herald_chunks_flushed 1"));
        assert!(text.contains("# TYPE herald_ads_published counter"));
    }
}
