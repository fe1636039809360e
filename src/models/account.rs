use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// One upstream identity. Rows are created by the account store; the dispatch
// core only mutates `is_invalid`, `last_used`, `model_rate_limits` and `quota`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    // Epoch millis of the most recent selection
    #[serde(default)]
    pub last_used: i64,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_rate_limits: HashMap<String, ModelRateLimit>,
    #[serde(default)]
    pub quota: QuotaSnapshot,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRateLimit {
    pub is_rate_limited: bool,
    // Absolute epoch millis at which the cooldown expires
    pub reset_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    // Epoch millis of the last quota refresh; 0 means never checked
    #[serde(default)]
    pub last_checked: i64,
    #[serde(default)]
    pub models: HashMap<String, ModelQuota>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelQuota {
    // Fraction of the model quota still available, in [0, 1]
    pub remaining_fraction: f64,
}

impl Account {
    pub fn new(email: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            enabled: true,
            is_invalid: false,
            invalid_reason: None,
            last_used: 0,
            refresh_token: refresh_token.into(),
            project_id: None,
            model_rate_limits: HashMap::new(),
            quota: QuotaSnapshot::default(),
        }
    }

    // Eligibility for dispatch on `model`: enabled, credentials valid, and any
    // per-model cooldown already expired at `now_ms`.
    pub fn is_usable_for(&self, model: &str, now_ms: i64) -> bool {
        if !self.enabled || self.is_invalid {
            return false;
        }
        match self.model_rate_limits.get(model) {
            Some(limit) => !limit.is_rate_limited || now_ms >= limit.reset_time,
            None => true,
        }
    }

    // Remaining cooldown on `model` in millis; 0 when not limited
    pub fn remaining_wait_ms(&self, model: &str, now_ms: i64) -> u64 {
        match self.model_rate_limits.get(model) {
            Some(limit) if limit.is_rate_limited && limit.reset_time > now_ms => {
                (limit.reset_time - now_ms) as u64
            }
            _ => 0,
        }
    }
}
