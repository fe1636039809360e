use crate::constants::now_ms;
use crate::models::Account;

// Reads the quota snapshot carried on each account row. The snapshot is
// refreshed by the account store; this tracker only interprets it for the
// selection strategy.
pub struct QuotaTracker {
    stale_ms: i64,
    critical_threshold: f64,
    low_threshold: f64,
    unknown_score: f64,
}

impl QuotaTracker {
    pub fn new(stale_ms: i64, critical_threshold: f64, low_threshold: f64) -> Self {
        Self {
            stale_ms,
            critical_threshold,
            low_threshold,
            unknown_score: crate::constants::QUOTA_UNKNOWN_SCORE,
        }
    }

    pub fn with_defaults() -> Self {
        use crate::constants::*;
        Self::new(QUOTA_STALE_MS, QUOTA_CRITICAL_THRESHOLD, QUOTA_LOW_THRESHOLD)
    }

    pub fn get_quota_fraction(&self, account: &Account, model: &str) -> Option<f64> {
        account
            .quota
            .models
            .get(model)
            .map(|q| q.remaining_fraction)
    }

    pub fn is_quota_fresh(&self, account: &Account) -> bool {
        account.quota.last_checked > 0 && now_ms() - account.quota.last_checked < self.stale_ms
    }

    // Critical only when the fraction is both known and fresh; a stale
    // snapshot must not lock an account out of the candidate set.
    pub fn is_quota_critical(&self, account: &Account, model: &str) -> bool {
        match self.get_quota_fraction(account, model) {
            Some(fraction) => self.is_quota_fresh(account) && fraction <= self.critical_threshold,
            None => false,
        }
    }

    pub fn is_quota_low(&self, account: &Account, model: &str) -> bool {
        match self.get_quota_fraction(account, model) {
            Some(fraction) => {
                fraction > self.critical_threshold && fraction <= self.low_threshold
            }
            None => false,
        }
    }

    // Selection score in [0, 100]. Unknown quota scores neutral; a stale
    // fraction is discounted by 10%.
    pub fn get_score(&self, account: &Account, model: &str) -> f64 {
        match self.get_quota_fraction(account, model) {
            Some(fraction) => {
                let base = fraction * 100.0;
                if self.is_quota_fresh(account) {
                    base
                } else {
                    base * 0.9
                }
            }
            None => self.unknown_score,
        }
    }
}
