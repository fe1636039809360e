use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::{now_ms, DEDUP_ENTRY_TTL_MS, DEDUP_SWEEP_INTERVAL_SECS};

// Per-model timestamp of the last short rate limit. When several in-flight
// requests hit the same short 429, only the first retries locally; the rest
// rotate accounts immediately instead of stampeding the same model.
pub struct DedupWindow {
    entries: DashMap<String, i64>,
    window_ms: u64,
}

impl DedupWindow {
    pub fn new(window_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            window_ms,
        }
    }

    pub fn record(&self, model: &str) {
        self.entries.insert(model.to_string(), now_ms());
    }

    pub fn should_skip_retry(&self, model: &str) -> bool {
        match self.entries.get(model) {
            Some(ts) => now_ms() - *ts < self.window_ms as i64,
            None => false,
        }
    }

    // Called on every successful request for the model.
    pub fn clear(&self, model: &str) {
        self.entries.remove(model);
    }

    pub fn sweep_older_than(&self, ttl_ms: i64) -> usize {
        let cutoff = now_ms() - ttl_ms;
        let before = self.entries.len();
        self.entries.retain(|_, ts| *ts > cutoff);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Background pruning of stale dedup entries. The sweep takes the same
// per-key write path as the foreground updates.
pub fn start_sweeper(
    window: Arc<DedupWindow>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(DEDUP_SWEEP_INTERVAL_SECS));
        // The first tick fires immediately; skip it so a fresh entry survives
        // its full window.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("dedup sweeper received cancel signal");
                    break;
                }
                _ = interval.tick() => {
                    let removed = window.sweep_older_than(DEDUP_ENTRY_TTL_MS);
                    if removed > 0 {
                        debug!("dedup sweeper removed {} stale entr(ies)", removed);
                    }
                }
            }
        }
    })
}
