use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::accounts::AccountStore;
use crate::constants::now_ms;
use crate::dispatch::health::HealthTracker;
use crate::dispatch::quota::QuotaTracker;
use crate::dispatch::token_bucket::TokenBucketTracker;
use crate::models::{Account, SelectionPolicy};

// Outcome of one selection round. `account == None` with `wait_ms > 0` asks
// the dispatcher to sit out a short cooldown and try again; `None` with zero
// wait means nothing is usable right now.
#[derive(Debug, Clone)]
pub struct Selection {
    pub account: Option<Account>,
    pub index: usize,
    pub wait_ms: u64,
}

impl Selection {
    fn none() -> Self {
        Self {
            account: None,
            index: 0,
            wait_ms: 0,
        }
    }
}

// Account picker with three policies sharing one signature and lifecycle
// hooks. The cursor doubles as the sticky current index and the round-robin
// position.
pub struct SelectionStrategy {
    policy: SelectionPolicy,
    cursor: AtomicUsize,
    max_wait_before_error_ms: u64,
    accounts: Arc<AccountStore>,
    health: Arc<HealthTracker>,
    buckets: Arc<TokenBucketTracker>,
    quota: Arc<QuotaTracker>,
}

impl SelectionStrategy {
    pub fn new(
        policy: SelectionPolicy,
        max_wait_before_error_ms: u64,
        accounts: Arc<AccountStore>,
        health: Arc<HealthTracker>,
        buckets: Arc<TokenBucketTracker>,
        quota: Arc<QuotaTracker>,
    ) -> Self {
        Self {
            policy,
            cursor: AtomicUsize::new(0),
            max_wait_before_error_ms,
            accounts,
            health,
            buckets,
            quota,
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn select(&self, pool: &[Account], model: &str) -> Selection {
        if pool.is_empty() {
            return Selection::none();
        }
        match self.policy {
            SelectionPolicy::Sticky => self.select_sticky(pool, model),
            SelectionPolicy::RoundRobin => self.select_round_robin(pool, model),
            SelectionPolicy::Hybrid => self.select_hybrid(pool, model),
        }
    }

    // Stay on the current account as long as it serves the model; otherwise
    // scan forward with wrap-around. When the sticky account is only briefly
    // limited and nothing else is usable, report the wait instead of failing.
    fn select_sticky(&self, pool: &[Account], model: &str) -> Selection {
        let now = now_ms();
        let current = self.cursor.load(Ordering::Relaxed).min(pool.len() - 1);

        if pool[current].is_usable_for(model, now) {
            self.cursor.store(current, Ordering::Relaxed);
            return Selection {
                account: Some(pool[current].clone()),
                index: current,
                wait_ms: 0,
            };
        }

        for step in 1..pool.len() {
            let idx = (current + step) % pool.len();
            if pool[idx].is_usable_for(model, now) {
                debug!(
                    from = current,
                    to = idx,
                    "sticky account unusable, moving forward"
                );
                self.cursor.store(idx, Ordering::Relaxed);
                return Selection {
                    account: Some(pool[idx].clone()),
                    index: idx,
                    wait_ms: 0,
                };
            }
        }

        let wait = pool[current].remaining_wait_ms(model, now);
        if wait > 0 && wait <= self.max_wait_before_error_ms {
            return Selection {
                account: None,
                index: current,
                wait_ms: wait,
            };
        }
        Selection::none()
    }

    // Probing starts at (cursor + 1) mod N, never at the cursor itself, so
    // consecutive requests spread across the pool.
    fn select_round_robin(&self, pool: &[Account], model: &str) -> Selection {
        let now = now_ms();
        let start = (self.cursor.load(Ordering::Relaxed) + 1) % pool.len();

        for step in 0..pool.len() {
            let idx = (start + step) % pool.len();
            if pool[idx].is_usable_for(model, now) {
                self.cursor.store(idx, Ordering::Relaxed);
                return Selection {
                    account: Some(pool[idx].clone()),
                    index: idx,
                    wait_ms: 0,
                };
            }
        }
        Selection::none()
    }

    // Weighted scoring over health, remaining credits, quota and recency.
    // Quota-critical accounts are shielded unless they are all that is left.
    fn select_hybrid(&self, pool: &[Account], model: &str) -> Selection {
        let now = now_ms();
        let usable = |a: &&Account| {
            a.is_usable_for(model, now)
                && self.health.is_usable(&a.email)
                && self.buckets.has_tokens(&a.email)
        };

        let mut candidates: Vec<&Account> = pool
            .iter()
            .filter(usable)
            .filter(|a| !self.quota.is_quota_critical(a, model))
            .collect();
        if candidates.is_empty() {
            candidates = pool.iter().filter(usable).collect();
        }
        if candidates.is_empty() {
            return Selection::none();
        }

        let mut best: Option<(usize, f64)> = None;
        for candidate in &candidates {
            let score = self.hybrid_score(candidate, model, now);
            // Strict comparison keeps ties stable by insertion order
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                let index = pool
                    .iter()
                    .position(|a| a.email == candidate.email)
                    .unwrap_or(0);
                best = Some((index, score));
            }
        }

        let (index, score) = best.expect("candidates is non-empty");
        let chosen = pool[index].clone();
        debug!(email = %chosen.email, score, "hybrid selection");

        self.buckets.consume(&chosen.email);
        self.accounts.touch_last_used(&chosen.email, now);
        Selection {
            account: Some(chosen),
            index,
            wait_ms: 0,
        }
    }

    fn hybrid_score(&self, account: &Account, model: &str, now: i64) -> f64 {
        let health = self.health.get_score(&account.email) as f64;
        let tokens = self.buckets.get_tokens(&account.email) as f64
            / self.buckets.get_max_tokens().max(1) as f64;
        let quota = self.quota.get_score(account, model);
        let minutes_idle = if account.last_used > 0 {
            (((now - account.last_used) as f64) / 60_000.0).clamp(0.0, 60.0)
        } else {
            60.0
        };
        2.0 * health + 5.0 * tokens * 100.0 + 3.0 * quota + 0.1 * minutes_idle
    }

    // Lifecycle hooks, called once per dispatch outcome.

    pub fn on_success(&self, email: &str) {
        self.health.record_success(email);
    }

    pub fn on_rate_limit(&self, email: &str) {
        self.health.record_rate_limit(email);
    }

    pub fn on_failure(&self, email: &str) {
        self.health.record_failure(email);
        if self.policy == SelectionPolicy::Hybrid {
            self.buckets.refund(email);
        }
    }

    // Cancelled mid-dispatch: give the consumed credit back without touching
    // health, the account did nothing wrong.
    pub fn on_cancel(&self, email: &str) {
        if self.policy == SelectionPolicy::Hybrid {
            self.buckets.refund(email);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelQuota, ModelRateLimit};

    const MODEL: &str = "gemini-3-pro";

    fn strategy(policy: SelectionPolicy, accounts: &[Account]) -> (Arc<AccountStore>, SelectionStrategy) {
        let store = Arc::new(AccountStore::in_memory());
        for account in accounts {
            store.insert(account.clone());
        }
        let strategy = SelectionStrategy::new(
            policy,
            crate::constants::MAX_WAIT_BEFORE_ERROR_MS,
            store.clone(),
            Arc::new(HealthTracker::with_defaults()),
            Arc::new(TokenBucketTracker::with_defaults()),
            Arc::new(QuotaTracker::with_defaults()),
        );
        (store, strategy)
    }

    fn limited(email: &str, reset_in_ms: i64) -> Account {
        let mut account = Account::new(email, "rt");
        account.model_rate_limits.insert(
            MODEL.to_string(),
            ModelRateLimit {
                is_rate_limited: true,
                reset_time: now_ms() + reset_in_ms,
            },
        );
        account
    }

    #[test]
    fn sticky_keeps_current_account_while_usable() {
        let pool = vec![Account::new("a@x", "rt"), Account::new("b@x", "rt")];
        let (_, strategy) = strategy(SelectionPolicy::Sticky, &pool);

        for _ in 0..3 {
            let selection = strategy.select(&pool, MODEL);
            assert_eq!(selection.account.unwrap().email, "a@x");
        }
    }

    #[test]
    fn sticky_out_of_range_cursor_clamps() {
        let pool = vec![Account::new("a@x", "rt"), Account::new("b@x", "rt")];
        let (_, strategy) = strategy(SelectionPolicy::Sticky, &pool);
        strategy.cursor.store(17, Ordering::Relaxed);

        let selection = strategy.select(&pool, MODEL);
        assert_eq!(selection.account.unwrap().email, "b@x");
        assert_eq!(selection.index, 1);
    }

    #[test]
    fn sticky_reports_short_wait_when_pool_is_locked() {
        let pool = vec![limited("a@x", 30_000)];
        let (_, strategy) = strategy(SelectionPolicy::Sticky, &pool);

        let selection = strategy.select(&pool, MODEL);
        assert!(selection.account.is_none());
        assert!(selection.wait_ms > 25_000 && selection.wait_ms <= 30_000);
    }

    #[test]
    fn sticky_gives_up_on_long_wait() {
        let pool = vec![limited("a@x", 600_000)];
        let (_, strategy) = strategy(SelectionPolicy::Sticky, &pool);

        let selection = strategy.select(&pool, MODEL);
        assert!(selection.account.is_none());
        assert_eq!(selection.wait_ms, 0);
    }

    #[test]
    fn round_robin_probes_cursor_plus_one_first() {
        let pool = vec![
            Account::new("a@x", "rt"),
            Account::new("b@x", "rt"),
            Account::new("c@x", "rt"),
        ];
        let (_, strategy) = strategy(SelectionPolicy::RoundRobin, &pool);

        let first = strategy.select(&pool, MODEL);
        assert_eq!(first.account.unwrap().email, "b@x");
        let second = strategy.select(&pool, MODEL);
        assert_eq!(second.account.unwrap().email, "c@x");
        let third = strategy.select(&pool, MODEL);
        assert_eq!(third.account.unwrap().email, "a@x");
    }

    #[test]
    fn round_robin_skips_unusable_accounts() {
        let pool = vec![
            Account::new("a@x", "rt"),
            limited("b@x", 60_000),
            Account::new("c@x", "rt"),
        ];
        let (_, strategy) = strategy(SelectionPolicy::RoundRobin, &pool);

        let selection = strategy.select(&pool, MODEL);
        assert_eq!(selection.account.unwrap().email, "c@x");
    }

    #[test]
    fn round_robin_returns_none_when_everything_is_locked() {
        let pool = vec![limited("a@x", 60_000), limited("b@x", 60_000)];
        let (_, strategy) = strategy(SelectionPolicy::RoundRobin, &pool);

        let selection = strategy.select(&pool, MODEL);
        assert!(selection.account.is_none());
        assert_eq!(selection.wait_ms, 0);
    }

    #[test]
    fn hybrid_prefers_higher_quota_on_otherwise_equal_accounts() {
        let mut low = Account::new("low@x", "rt");
        low.quota.last_checked = now_ms();
        low.quota.models.insert(
            MODEL.to_string(),
            ModelQuota {
                remaining_fraction: 0.20,
            },
        );
        let mut high = Account::new("high@x", "rt");
        high.quota.last_checked = now_ms();
        high.quota.models.insert(
            MODEL.to_string(),
            ModelQuota {
                remaining_fraction: 0.80,
            },
        );

        let pool = vec![low, high];
        let (store, strategy) = strategy(SelectionPolicy::Hybrid, &pool);

        let before = strategy.buckets.get_tokens("high@x");
        let selection = strategy.select(&pool, MODEL);
        assert_eq!(selection.account.unwrap().email, "high@x");
        assert_eq!(strategy.buckets.get_tokens("high@x"), before - 1);
        assert!(store.get("high@x").unwrap().last_used > 0);
    }

    #[test]
    fn hybrid_shields_quota_critical_accounts_until_none_remain() {
        let mut critical = Account::new("critical@x", "rt");
        critical.quota.last_checked = now_ms();
        critical.quota.models.insert(
            MODEL.to_string(),
            ModelQuota {
                remaining_fraction: 0.02,
            },
        );
        let healthy = Account::new("healthy@x", "rt");

        let pool = vec![critical.clone(), healthy];
        let (_, strategy) = strategy(SelectionPolicy::Hybrid, &pool);
        let selection = strategy.select(&pool, MODEL);
        assert_eq!(selection.account.unwrap().email, "healthy@x");

        // With only the critical account left, the shield drops
        let pool = vec![critical];
        let (_, strategy2) = strategy_rebuild(&strategy, &pool);
        let selection = strategy2.select(&pool, MODEL);
        assert_eq!(selection.account.unwrap().email, "critical@x");
    }

    // Rebuild a hybrid strategy over a new pool, preserving nothing; helper
    // keeps the shield test readable.
    fn strategy_rebuild(
        _old: &SelectionStrategy,
        pool: &[Account],
    ) -> (Arc<AccountStore>, SelectionStrategy) {
        strategy(SelectionPolicy::Hybrid, pool)
    }

    #[test]
    fn hybrid_failure_hook_refunds_token_and_penalizes_health() {
        let pool = vec![Account::new("a@x", "rt")];
        let (_, strategy) = strategy(SelectionPolicy::Hybrid, &pool);

        let before = strategy.buckets.get_tokens("a@x");
        strategy.select(&pool, MODEL);
        assert_eq!(strategy.buckets.get_tokens("a@x"), before - 1);

        strategy.on_failure("a@x");
        assert_eq!(strategy.buckets.get_tokens("a@x"), before);
        assert_eq!(strategy.health.get_score("a@x"), 50);
    }

    #[test]
    fn hybrid_ties_break_by_insertion_order() {
        let pool = vec![Account::new("first@x", "rt"), Account::new("second@x", "rt")];
        let (_, strategy) = strategy(SelectionPolicy::Hybrid, &pool);

        let selection = strategy.select(&pool, MODEL);
        assert_eq!(selection.account.unwrap().email, "first@x");
        assert_eq!(selection.index, 0);
    }
}
