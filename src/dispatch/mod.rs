pub mod classify;
pub mod dedup;
pub mod engine;
pub mod fallback;
pub mod health;
pub mod ledger;
pub mod quota;
pub mod reset_parser;
pub mod strategy;
pub mod streaming;
pub mod timing;
pub mod token_bucket;


use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::DispatchConfig;

pub use engine::DispatchEngine;

// Everything the dispatcher can surface. Rate-limit and auth kinds drive
// internal account switches; only what survives the outer loop reaches the
// client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("all accounts cooling down for {model}: expected wait {wait_ms}ms (resets at {reset_at_ms})")]
    ResourceExhausted {
        model: String,
        wait_ms: u64,
        reset_at_ms: i64,
    },

    #[error("quota exhausted on {email}: cooling down {reset_ms}ms")]
    QuotaExhausted { email: String, reset_ms: u64 },

    #[error("rate limited on {email}")]
    RateLimited { email: String },

    #[error("rate limited on {email} (suppressed by dedup window)")]
    RateLimitedDedup { email: String },

    #[error("account {email} credentials permanently invalid: {reason}")]
    AuthInvalidPermanent { email: String, reason: String },

    #[error("transient auth failure: {message}")]
    AuthInvalid { message: String },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("no accounts available for {model}")]
    NoAccounts { model: String },

    #[error("max retries exceeded for {model}")]
    MaxRetriesExceeded { model: String },

    #[error("request cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            Self::QuotaExhausted { .. } | Self::RateLimited { .. } | Self::RateLimitedDedup { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::AuthInvalidPermanent { .. } | Self::AuthInvalid { .. }
        )
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status >= 500)
    }

    // Errors that justify substituting the fallback model before giving up.
    pub fn wants_model_fallback(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::MaxRetriesExceeded { .. }
        )
    }
}

// Process-wide dispatch state: the trackers, the dedup window and its
// sweeper. Constructed once at startup and handed to the engine; the sweeper
// dies with the cancellation token on shutdown.
pub struct DispatchState {
    pub health: Arc<health::HealthTracker>,
    pub buckets: Arc<token_bucket::TokenBucketTracker>,
    pub quota: Arc<quota::QuotaTracker>,
    pub dedup: Arc<dedup::DedupWindow>,
    cancel: CancellationToken,
    sweeper: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DispatchState {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            health: Arc::new(health::HealthTracker::new(
                config.health_initial_score,
                config.health_min_usable,
                config.health_max_score,
                config.health_success_reward,
                config.health_rate_limit_penalty,
                config.health_failure_penalty,
            )),
            buckets: Arc::new(token_bucket::TokenBucketTracker::new(
                config.bucket_max_tokens,
            )),
            quota: Arc::new(quota::QuotaTracker::new(
                config.quota_stale_ms,
                config.quota_critical_threshold,
                config.quota_low_threshold,
            )),
            dedup: Arc::new(dedup::DedupWindow::new(config.rate_limit_dedup_window_ms)),
            cancel: CancellationToken::new(),
            sweeper: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn start_sweeper(&self) {
        let handle = dedup::start_sweeper(self.dedup.clone(), self.cancel.child_token());
        let mut guard = self.sweeper.lock().await;
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(handle);
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
    }
}
