use dashmap::DashMap;

// Soft per-account request credits. There is no timed refill: `refund` on a
// failed dispatch is the only replenishment, which keeps a misbehaving account
// from absorbing the whole pool's traffic.
pub struct TokenBucketTracker {
    buckets: DashMap<String, u32>,
    max_tokens: u32,
}

impl TokenBucketTracker {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            max_tokens,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(crate::constants::BUCKET_MAX_TOKENS)
    }

    fn entry(&self, email: &str) -> dashmap::mapref::one::RefMut<'_, String, u32> {
        self.buckets
            .entry(email.to_string())
            .or_insert(crate::constants::BUCKET_INITIAL_TOKENS.min(self.max_tokens))
    }

    // Takes one credit; false when the bucket is dry.
    pub fn consume(&self, email: &str) -> bool {
        let mut tokens = self.entry(email);
        if *tokens >= 1 {
            *tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn refund(&self, email: &str) {
        let mut tokens = self.entry(email);
        *tokens = (*tokens + 1).min(self.max_tokens);
    }

    pub fn has_tokens(&self, email: &str) -> bool {
        *self.entry(email) >= 1
    }

    pub fn get_tokens(&self, email: &str) -> u32 {
        *self.entry(email)
    }

    pub fn get_max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn reset(&self, email: &str) {
        self.buckets.remove(email);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_then_refund_is_a_no_op() {
        let buckets = TokenBucketTracker::with_defaults();
        let before = buckets.get_tokens("a@x");
        assert!(buckets.consume("a@x"));
        buckets.refund("a@x");
        assert_eq!(buckets.get_tokens("a@x"), before);
    }

    #[test]
    fn empty_bucket_rejects_consume() {
        let buckets = TokenBucketTracker::new(2);
        assert!(buckets.consume("a@x"));
        assert!(buckets.consume("a@x"));
        assert!(!buckets.consume("a@x"));
        assert!(!buckets.has_tokens("a@x"));
    }

    #[test]
    fn refund_never_exceeds_cap() {
        let buckets = TokenBucketTracker::new(3);
        buckets.refund("a@x");
        buckets.refund("a@x");
        assert_eq!(buckets.get_tokens("a@x"), 3);
    }
}
