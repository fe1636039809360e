use tokio_util::sync::CancellationToken;

// Symmetric random jitter: `base_ms` shifted by up to ±`fraction` of itself.
// Keeps concurrent cooldown sleepers from waking in lockstep.
pub fn jitter_ms(base_ms: u64, fraction: f64) -> u64 {
    use rand::Rng;
    if base_ms == 0 || fraction <= 0.0 {
        return base_ms;
    }
    let spread = (base_ms as f64 * fraction).round() as i64;
    if spread == 0 {
        return base_ms;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    (base_ms as i64 + offset).max(0) as u64
}

// Sleep that aborts early when the request is cancelled. Returns false on
// cancellation so callers can unwind without completing the state machine.
pub async fn sleep_cancellable(ms: u64, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..200 {
            let v = jitter_ms(1_000, 0.2);
            assert!((800..=1_200).contains(&v), "v = {}", v);
        }
    }

    #[test]
    fn zero_base_is_untouched() {
        assert_eq!(jitter_ms(0, 0.5), 0);
        assert_eq!(jitter_ms(500, 0.0), 500);
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_false_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = std::time::Instant::now();
        assert!(!sleep_cancellable(60_000, &cancel).await);
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn uncancelled_sleep_completes() {
        let cancel = CancellationToken::new();
        assert!(sleep_cancellable(5, &cancel).await);
    }
}
