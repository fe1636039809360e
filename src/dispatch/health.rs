use dashmap::DashMap;

// Per-account health score with reward/penalty updates. Scores are clamped to
// [0, max_score]; the consecutive-failure counter feeds the extended-cooldown
// decision in the dispatcher.
pub struct HealthTracker {
    states: DashMap<String, HealthState>,
    initial_score: i32,
    min_usable: i32,
    max_score: i32,
    success_reward: i32,
    rate_limit_penalty: i32,
    failure_penalty: i32,
}

#[derive(Debug, Clone, Copy)]
struct HealthState {
    score: i32,
    consecutive_failures: u32,
}

impl HealthTracker {
    pub fn new(
        initial_score: i32,
        min_usable: i32,
        max_score: i32,
        success_reward: i32,
        rate_limit_penalty: i32,
        failure_penalty: i32,
    ) -> Self {
        Self {
            states: DashMap::new(),
            initial_score,
            min_usable,
            max_score,
            success_reward,
            rate_limit_penalty,
            failure_penalty,
        }
    }

    pub fn with_defaults() -> Self {
        use crate::constants::*;
        Self::new(
            HEALTH_INITIAL_SCORE,
            HEALTH_MIN_USABLE,
            HEALTH_MAX_SCORE,
            HEALTH_SUCCESS_REWARD,
            HEALTH_RATE_LIMIT_PENALTY,
            HEALTH_FAILURE_PENALTY,
        )
    }

    fn entry(&self, email: &str) -> dashmap::mapref::one::RefMut<'_, String, HealthState> {
        self.states
            .entry(email.to_string())
            .or_insert(HealthState {
                score: self.initial_score,
                consecutive_failures: 0,
            })
    }

    pub fn get_score(&self, email: &str) -> i32 {
        self.entry(email).score
    }

    pub fn record_success(&self, email: &str) {
        let mut state = self.entry(email);
        state.score = (state.score + self.success_reward).min(self.max_score);
        state.consecutive_failures = 0;
    }

    pub fn record_rate_limit(&self, email: &str) {
        let mut state = self.entry(email);
        state.score = (state.score + self.rate_limit_penalty).max(0);
        state.consecutive_failures += 1;
    }

    pub fn record_failure(&self, email: &str) {
        let mut state = self.entry(email);
        state.score = (state.score + self.failure_penalty).max(0);
        state.consecutive_failures += 1;
    }

    pub fn is_usable(&self, email: &str) -> bool {
        self.get_score(email) >= self.min_usable
    }

    pub fn get_consecutive_failures(&self, email: &str) -> u32 {
        self.entry(email).consecutive_failures
    }

    pub fn max_score(&self) -> i32 {
        self.max_score
    }

    pub fn reset(&self, email: &str) {
        self.states.remove(email);
    }

    pub fn clear(&self) {
        self.states.clear();
    }
}
