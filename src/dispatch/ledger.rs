use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::accounts::AccountStore;
use crate::auth::AuthBroker;
use crate::constants::now_ms;
use crate::models::{Account, ModelRateLimit};

// Cooldown and validity bookkeeping over the shared account pool. All writes
// to account rate-limit state funnel through here so the selection strategies
// only ever read.
pub struct RateLimitLedger {
    accounts: Arc<AccountStore>,
    auth: Arc<AuthBroker>,
}

impl RateLimitLedger {
    pub fn new(accounts: Arc<AccountStore>, auth: Arc<AuthBroker>) -> Self {
        Self { accounts, auth }
    }

    // Drops every cooldown whose reset time has passed. Runs at the top of
    // each outer dispatch iteration, so a freshly expired account is visible
    // to the very next selection.
    pub fn clear_expired(&self) {
        let now = now_ms();
        for account in self.accounts.snapshot() {
            let expired: Vec<String> = account
                .model_rate_limits
                .iter()
                .filter(|(_, limit)| limit.is_rate_limited && limit.reset_time <= now)
                .map(|(model, _)| model.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            self.accounts.update(&account.email, |row| {
                for model in &expired {
                    if let Some(limit) = row.model_rate_limits.get_mut(model) {
                        limit.is_rate_limited = false;
                    }
                }
            });
            debug!(
                email = %account.email,
                models = ?expired,
                "cleared expired rate limit(s)"
            );
        }
    }

    // Accounts eligible for `model` right now.
    pub fn available_accounts(&self, model: &str) -> Vec<Account> {
        let now = now_ms();
        self.accounts
            .snapshot()
            .into_iter()
            .filter(|a| a.is_usable_for(model, now))
            .collect()
    }

    // True when every otherwise-usable account holds an unexpired cooldown
    // for `model`. Distinct from "pool empty": disabled/invalid rows do not
    // make a model rate-limited, they just shrink the pool.
    pub fn is_all_rate_limited(&self, model: &str) -> bool {
        let now = now_ms();
        let mut saw_candidate = false;
        for account in self.accounts.snapshot() {
            if !account.enabled || account.is_invalid {
                continue;
            }
            saw_candidate = true;
            if account.remaining_wait_ms(model, now) == 0 {
                return false;
            }
        }
        saw_candidate
    }

    // Shortest remaining cooldown across the pool for `model`, in millis.
    pub fn min_wait_ms(&self, model: &str) -> u64 {
        let now = now_ms();
        self.accounts
            .snapshot()
            .iter()
            .filter(|a| a.enabled && !a.is_invalid)
            .map(|a| a.remaining_wait_ms(model, now))
            .filter(|&w| w > 0)
            .min()
            .unwrap_or(0)
    }

    pub fn mark_rate_limited(&self, email: &str, cooldown_ms: u64, model: &str) {
        let reset_time = now_ms() + cooldown_ms as i64;
        self.accounts.update(email, |row| {
            row.model_rate_limits.insert(
                model.to_string(),
                ModelRateLimit {
                    is_rate_limited: true,
                    reset_time,
                },
            );
        });
        info!(
            email,
            model,
            cooldown_ms,
            "account rate limited"
        );
    }

    pub fn mark_invalid(&self, email: &str, reason: &str) {
        self.accounts.update(email, |row| {
            row.is_invalid = true;
            row.invalid_reason = Some(reason.to_string());
        });
        self.auth.clear_token_cache(email);
        self.auth.clear_project_cache(email);
        warn!(email, reason, "account marked invalid");
    }

    pub fn clear_token_cache(&self, email: &str) {
        self.auth.clear_token_cache(email);
    }

    pub fn clear_project_cache(&self, email: &str) {
        self.auth.clear_project_cache(email);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(accounts: Vec<Account>) -> (Arc<AccountStore>, RateLimitLedger) {
        let store = Arc::new(AccountStore::in_memory());
        for account in accounts {
            store.insert(account);
        }
        let auth = Arc::new(AuthBroker::new("client".to_string(), None));
        (store.clone(), RateLimitLedger::new(store, auth))
    }

    #[test]
    fn mark_and_clear_expired_round_trip() {
        let (store, ledger) = ledger_with(vec![Account::new("a@x", "rt")]);
        ledger.mark_rate_limited("a@x", 60_000, "gemini-3-pro");
        assert!(ledger.available_accounts("gemini-3-pro").is_empty());

        // Force the entry into the past, then sweep
        store.update("a@x", |row| {
            row.model_rate_limits
                .get_mut("gemini-3-pro")
                .unwrap()
                .reset_time = now_ms() - 1;
        });
        ledger.clear_expired();

        let account = store.get("a@x").unwrap();
        let limit = &account.model_rate_limits["gemini-3-pro"];
        assert!(!limit.is_rate_limited);
        assert_eq!(ledger.available_accounts("gemini-3-pro").len(), 1);
    }

    #[test]
    fn all_rate_limited_ignores_disabled_rows() {
        let mut disabled = Account::new("b@x", "rt");
        disabled.enabled = false;
        let (_, ledger) = ledger_with(vec![Account::new("a@x", "rt"), disabled]);

        assert!(!ledger.is_all_rate_limited("gemini-3-pro"));
        ledger.mark_rate_limited("a@x", 60_000, "gemini-3-pro");
        assert!(ledger.is_all_rate_limited("gemini-3-pro"));
    }

    #[test]
    fn min_wait_picks_shortest_cooldown() {
        let (_, ledger) = ledger_with(vec![Account::new("a@x", "rt"), Account::new("b@x", "rt")]);
        ledger.mark_rate_limited("a@x", 90_000, "gemini-3-pro");
        ledger.mark_rate_limited("b@x", 30_000, "gemini-3-pro");

        let wait = ledger.min_wait_ms("gemini-3-pro");
        assert!(wait > 25_000 && wait <= 30_000, "wait = {}", wait);
    }

    #[test]
    fn mark_invalid_sets_flag_and_reason() {
        let (store, ledger) = ledger_with(vec![Account::new("a@x", "rt")]);
        ledger.mark_invalid("a@x", "token revoked");

        let account = store.get("a@x").unwrap();
        assert!(account.is_invalid);
        assert_eq!(account.invalid_reason.as_deref(), Some("token revoked"));
        assert!(ledger.available_accounts("gemini-3-pro").is_empty());
    }

    #[test]
    fn empty_pool_is_not_all_rate_limited() {
        let (_, ledger) = ledger_with(vec![]);
        assert!(!ledger.is_all_rate_limited("gemini-3-pro"));
    }
}
