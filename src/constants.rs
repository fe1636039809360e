// Central home for the dispatch tunables and upstream identity. Defaults here
// are the shipped values; DispatchConfig carries per-deployment overrides.

pub const USER_AGENT: &str = concat!(
    "trestle/",
    env!("CARGO_PKG_VERSION"),
    " (cloudcode-proxy)"
);

// Ordered upstream base URLs, walked in order for every attempt. The prod
// host goes first; the daily sandbox absorbs traffic when prod sheds load.
pub const ENDPOINT_FALLBACKS: [&str; 2] = [
    "https://cloudcode-pa.googleapis.com/v1internal",
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal",
];

// Outer dispatch loop
pub const MAX_RETRIES: usize = 3;
pub const MAX_WAIT_BEFORE_ERROR_MS: u64 = 120_000;
pub const DEFAULT_COOLDOWN_MS: u64 = 10_000;
pub const RATE_LIMIT_DEDUP_WINDOW_MS: u64 = 2_000;
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const EXTENDED_COOLDOWN_MS: u64 = 300_000;

// 429s that are server-side capacity rather than per-user quota
pub const CAPACITY_RETRY_DELAY_MS: u64 = 2_000;
pub const MAX_CAPACITY_RETRIES: u32 = 3;

// Streaming empty-response recovery
pub const MAX_EMPTY_RESPONSE_RETRIES: u32 = 3;
pub const EMPTY_RETRY_BACKOFF_MS: [u64; 3] = [500, 1_000, 2_000];

// Health tracker
pub const HEALTH_INITIAL_SCORE: i32 = 70;
pub const HEALTH_MIN_USABLE: i32 = 50;
pub const HEALTH_MAX_SCORE: i32 = 100;
pub const HEALTH_SUCCESS_REWARD: i32 = 1;
pub const HEALTH_RATE_LIMIT_PENALTY: i32 = -10;
pub const HEALTH_FAILURE_PENALTY: i32 = -20;

// Token bucket
pub const BUCKET_INITIAL_TOKENS: u32 = 50;
pub const BUCKET_MAX_TOKENS: u32 = 50;

// Quota tracker
pub const QUOTA_STALE_MS: i64 = 300_000;
pub const QUOTA_CRITICAL_THRESHOLD: f64 = 0.05;
pub const QUOTA_LOW_THRESHOLD: f64 = 0.10;
pub const QUOTA_UNKNOWN_SCORE: f64 = 50.0;

// Dedup sweeper cadence and entry lifetime
pub const DEDUP_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEDUP_ENTRY_TTL_MS: i64 = 60_000;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
