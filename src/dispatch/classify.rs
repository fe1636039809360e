// Text classification of upstream failures. All matching is lowercase
// substring based; the upstream wraps errors in several JSON shapes, so the
// raw body text is the only stable signal.

const PERMANENT_AUTH_MARKERS: [&str; 6] = [
    "invalid_grant",
    "token revoked",
    "token has been expired or revoked",
    "token_revoked",
    "invalid_client",
    "credentials are invalid",
];

const CAPACITY_MARKERS: [&str; 4] = [
    "model_capacity_exhausted",
    "capacity_exhausted",
    "model is currently overloaded",
    "service temporarily unavailable",
];

const NETWORK_MARKERS: [&str; 6] = [
    "fetch failed",
    "network error",
    "econnreset",
    "etimedout",
    "socket hang up",
    "timeout",
];

// Credentials are gone for good: mark the account invalid instead of retrying.
pub fn is_permanent_auth_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    PERMANENT_AUTH_MARKERS.iter().any(|m| lower.contains(m))
}

// Server-side model overload, as opposed to per-user quota.
pub fn is_model_capacity_exhausted(text: &str) -> bool {
    let lower = text.to_lowercase();
    CAPACITY_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn is_network_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    NETWORK_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_auth_markers_match_case_insensitively() {
        assert!(is_permanent_auth_failure("Error: INVALID_GRANT"));
        assert!(is_permanent_auth_failure(
            "the token has been expired or revoked"
        ));
        assert!(!is_permanent_auth_failure("401 unauthorized"));
    }

    #[test]
    fn capacity_markers_distinguish_overload_from_quota() {
        assert!(is_model_capacity_exhausted(
            r#"{"error":{"status":"MODEL_CAPACITY_EXHAUSTED"}}"#
        ));
        assert!(is_model_capacity_exhausted("The model is currently overloaded"));
        assert!(!is_model_capacity_exhausted("quota exceeded for this user"));
    }

    #[test]
    fn network_markers_cover_common_transport_failures() {
        assert!(is_network_error("connection closed: ECONNRESET"));
        assert!(is_network_error("request timeout after 600s"));
        assert!(!is_network_error("429 Too Many Requests"));
    }
}
