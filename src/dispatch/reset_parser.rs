use regex::Regex;
use std::sync::LazyLock;

// 429 reset extraction. Returns milliseconds until the limit lifts, or None
// when the response carries no usable hint (the dispatcher then falls back to
// DEFAULT_COOLDOWN_MS).

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    // "2h1m1s", "1h30m", "42s", "1.5s" and combinations
    Regex::new(r"(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)?").expect("invalid duration regex")
});

static TRY_AGAIN_M_S_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)try again in (\d+)m\s*(\d+)s").expect("invalid regex"));

static TRY_AGAIN_SECONDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:try again in|retry after|wait)\s*(\d+)\s*s(?:econds?)?\b")
        .expect("invalid regex")
});

// Parse a Go-style duration string ("30s", "1.5s", "2m30s", "500ms") to ms.
// Bare millisecond values are handled up front so the minute group cannot
// swallow the "m" of "ms".
fn parse_duration_ms(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(prefix) = s.strip_suffix("ms") {
        if let Ok(value) = prefix.parse::<f64>() {
            let total = value.ceil() as u64;
            return if total == 0 { None } else { Some(total) };
        }
    }

    let caps = DURATION_RE.captures(s)?;
    let hours: u64 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let minutes: u64 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let seconds: f64 = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0.0);

    let total = (hours * 3_600_000 + minutes * 60_000) as f64 + seconds * 1_000.0;
    let total = total.ceil() as u64;
    if total == 0 {
        None
    } else {
        Some(total)
    }
}

// Conventional Retry-After: integer seconds or an HTTP-date.
fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let delta_ms = date.timestamp_millis() - chrono::Utc::now().timestamp_millis();
        return Some(delta_ms.max(0) as u64);
    }
    None
}

// Google error payloads: RetryInfo detail or quota reset metadata, then the
// plain retry_after number some gateways attach.
fn parse_json_body(body: &str) -> Option<u64> {
    let trimmed = body.trim();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return None;
    }
    let json: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let details = json
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.as_array());

    if let Some(details) = details {
        for detail in details {
            let is_retry_info = detail
                .get("@type")
                .and_then(|t| t.as_str())
                .map(|t| t.contains("RetryInfo"))
                .unwrap_or(false);
            if is_retry_info {
                if let Some(delay) = detail.get("retryDelay").and_then(|v| v.as_str()) {
                    if let Some(ms) = parse_duration_ms(delay) {
                        return Some(ms);
                    }
                }
            }
            if let Some(delay) = detail
                .get("metadata")
                .and_then(|m| m.get("quotaResetDelay"))
                .and_then(|v| v.as_str())
            {
                if let Some(ms) = parse_duration_ms(delay) {
                    return Some(ms);
                }
            }
        }
    }

    json.get("error")
        .and_then(|e| e.get("retry_after"))
        .and_then(|v| v.as_u64())
        .map(|s| s.saturating_mul(1_000))
}

fn parse_free_text(body: &str) -> Option<u64> {
    if let Some(caps) = TRY_AGAIN_M_S_RE.captures(body) {
        let minutes: u64 = caps[1].parse().ok()?;
        let seconds: u64 = caps[2].parse().ok()?;
        return Some((minutes * 60 + seconds) * 1_000);
    }
    if let Some(caps) = TRY_AGAIN_SECONDS_RE.captures(body) {
        let seconds: u64 = caps[1].parse().ok()?;
        return Some(seconds * 1_000);
    }
    None
}

pub fn parse_reset_ms(retry_after_header: Option<&str>, body: &str) -> Option<u64> {
    if let Some(header) = retry_after_header {
        if let Some(ms) = parse_retry_after(header) {
            return Some(ms);
        }
    }
    parse_json_body(body).or_else(|| parse_free_text(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds_header() {
        assert_eq!(parse_reset_ms(Some("30"), ""), Some(30_000));
    }

    #[test]
    fn retry_after_http_date_header() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(45);
        let header = future.to_rfc2822();
        let ms = parse_reset_ms(Some(&header), "").unwrap();
        assert!(ms > 40_000 && ms <= 45_500, "ms = {}", ms);
    }

    #[test]
    fn google_retry_info_detail() {
        let body = r#"{
            "error": {
                "code": 429,
                "details": [
                    {
                        "@type": "type.googleapis.com/google.rpc.RetryInfo",
                        "retryDelay": "1.5s"
                    }
                ]
            }
        }"#;
        assert_eq!(parse_reset_ms(None, body), Some(1_500));
    }

    #[test]
    fn quota_reset_delay_metadata() {
        let body = r#"{"error":{"details":[{"metadata":{"quotaResetDelay":"2m30s"}}]}}"#;
        assert_eq!(parse_reset_ms(None, body), Some(150_000));
    }

    #[test]
    fn free_text_minutes_and_seconds() {
        assert_eq!(
            parse_reset_ms(None, "Rate limit exceeded. Try again in 2m 30s"),
            Some(150_000)
        );
    }

    #[test]
    fn free_text_seconds_case_insensitive() {
        assert_eq!(
            parse_reset_ms(None, "Quota hit. Retry After 99 Seconds"),
            Some(99_000)
        );
        assert_eq!(
            parse_reset_ms(None, "please try again in 3 seconds"),
            Some(3_000)
        );
    }

    #[test]
    fn header_wins_over_body() {
        let body = r#"{"error":{"retry_after": 60}}"#;
        assert_eq!(parse_reset_ms(Some("5"), body), Some(5_000));
    }

    #[test]
    fn unknown_body_returns_none() {
        assert_eq!(parse_reset_ms(None, "Too Many Requests"), None);
        assert_eq!(parse_reset_ms(None, ""), None);
    }

    #[test]
    fn duration_string_variants() {
        assert_eq!(parse_duration_ms("42s"), Some(42_000));
        assert_eq!(parse_duration_ms("500ms"), Some(500));
        assert_eq!(parse_duration_ms("1h30m"), Some(5_400_000));
        assert_eq!(parse_duration_ms("510.79ms"), Some(511));
        assert_eq!(parse_duration_ms("junk"), None);
    }
}
