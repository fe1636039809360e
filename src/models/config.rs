use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    // Optional static inbound key; empty disables the check
    pub api_key: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8046,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    Sticky,
    RoundRobin,
    Hybrid,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::Hybrid
    }
}

// Every knob of the dispatch state machine. Shipped defaults live in
// `constants`; tests shrink the delays to keep scenarios fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub policy: SelectionPolicy,
    pub fallback_enabled: bool,
    // requested model -> lower-tier substitute, merged over the built-ins
    pub fallback_models: HashMap<String, String>,
    pub endpoints: Vec<String>,

    pub max_retries: usize,
    pub max_wait_before_error_ms: u64,
    pub default_cooldown_ms: u64,
    pub rate_limit_dedup_window_ms: u64,
    pub max_consecutive_failures: u32,
    pub extended_cooldown_ms: u64,
    pub capacity_retry_delay_ms: u64,
    pub max_capacity_retries: u32,
    pub max_empty_response_retries: u32,

    pub health_initial_score: i32,
    pub health_min_usable: i32,
    pub health_max_score: i32,
    pub health_success_reward: i32,
    pub health_rate_limit_penalty: i32,
    pub health_failure_penalty: i32,

    pub bucket_max_tokens: u32,

    pub quota_stale_ms: i64,
    pub quota_critical_threshold: f64,
    pub quota_low_threshold: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            fallback_enabled: true,
            fallback_models: HashMap::new(),
            endpoints: constants::ENDPOINT_FALLBACKS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_retries: constants::MAX_RETRIES,
            max_wait_before_error_ms: constants::MAX_WAIT_BEFORE_ERROR_MS,
            default_cooldown_ms: constants::DEFAULT_COOLDOWN_MS,
            rate_limit_dedup_window_ms: constants::RATE_LIMIT_DEDUP_WINDOW_MS,
            max_consecutive_failures: constants::MAX_CONSECUTIVE_FAILURES,
            extended_cooldown_ms: constants::EXTENDED_COOLDOWN_MS,
            capacity_retry_delay_ms: constants::CAPACITY_RETRY_DELAY_MS,
            max_capacity_retries: constants::MAX_CAPACITY_RETRIES,
            max_empty_response_retries: constants::MAX_EMPTY_RESPONSE_RETRIES,
            health_initial_score: constants::HEALTH_INITIAL_SCORE,
            health_min_usable: constants::HEALTH_MIN_USABLE,
            health_max_score: constants::HEALTH_MAX_SCORE,
            health_success_reward: constants::HEALTH_SUCCESS_REWARD,
            health_rate_limit_penalty: constants::HEALTH_RATE_LIMIT_PENALTY,
            health_failure_penalty: constants::HEALTH_FAILURE_PENALTY,
            bucket_max_tokens: constants::BUCKET_MAX_TOKENS,
            quota_stale_ms: constants::QUOTA_STALE_MS,
            quota_critical_threshold: constants::QUOTA_CRITICAL_THRESHOLD,
            quota_low_threshold: constants::QUOTA_LOW_THRESHOLD,
        }
    }
}

// Config file lives next to the account directory; a missing file means
// defaults, a malformed one is a startup error.
pub fn load_app_config(data_dir: &std::path::Path) -> Result<AppConfig, String> {
    let path = data_dir.join("trestle.json");
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("invalid config JSON: {}", e))
}

pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => {
                tracing::info!("using proxy port from environment: {}", p);
                config.proxy.port = p;
            }
            _ => tracing::warn!("ignoring invalid PORT value: {}", port),
        }
    }
    if let Ok(key) = std::env::var("API_KEY") {
        if !key.trim().is_empty() {
            tracing::info!("using API key from environment");
            config.proxy.api_key = key;
        }
    }
}

pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if config.proxy.port == 0 {
        errors.push("proxy.port must be non-zero".to_string());
    }
    if config.dispatch.endpoints.is_empty() {
        errors.push("dispatch.endpoints must list at least one base URL".to_string());
    }
    if config.dispatch.max_retries == 0 {
        errors.push("dispatch.max_retries must be at least 1".to_string());
    }
    if config.dispatch.health_min_usable > config.dispatch.health_max_score {
        errors.push("dispatch.health_min_usable exceeds health_max_score".to_string());
    }
    if !(0.0..=1.0).contains(&config.dispatch.quota_critical_threshold)
        || !(0.0..=1.0).contains(&config.dispatch.quota_low_threshold)
    {
        errors.push("dispatch quota thresholds must be within [0, 1]".to_string());
    }
    if config.dispatch.quota_critical_threshold > config.dispatch.quota_low_threshold {
        errors.push("dispatch.quota_critical_threshold exceeds quota_low_threshold".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(validate_app_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn inverted_quota_thresholds_are_rejected() {
        let mut config = AppConfig::default();
        config.dispatch.quota_critical_threshold = 0.5;
        config.dispatch.quota_low_threshold = 0.1;
        let errors = validate_app_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("quota_critical_threshold")));
    }

    #[test]
    fn empty_endpoint_roster_is_rejected() {
        let mut config = AppConfig::default();
        config.dispatch.endpoints.clear();
        assert!(validate_app_config(&config).is_err());
    }
}
