//! Response bodies and headers produced by admission decisions.

use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitDecision;

/// Headers added to every allowed response.
pub const HARDENING_HEADERS: [(&str, &str); 6] = [
    (
        "content-security-policy",
        "default-src 'self'; frame-ancestors 'none'; object-src 'none'; base-uri 'self'",
    ),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("permissions-policy", "camera=(), microphone=(), geolocation=()"),
];

/// JSON body of a denied request.
///
/// `error` is a stable discriminator clients can match on; `message` is for
/// humans. Nothing internal ends up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error discriminator.
    pub error: String,
    /// Human-readable explanation.
    pub message: String,
    /// Optional machine-readable code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    /// Create a body without a code.
    #[must_use]
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            code: None,
        }
    }

    /// Attach a code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// `X-RateLimit-*` headers for a rate-limit decision.
#[must_use]
pub fn rate_limit_headers(decision: &RateLimitDecision) -> Vec<(String, String)> {
    vec![
        ("x-ratelimit-limit".into(), decision.limit.to_string()),
        ("x-ratelimit-remaining".into(), decision.remaining.to_string()),
        ("x-ratelimit-reset".into(), decision.reset_epoch_secs().to_string()),
    ]
}

/// [`HARDENING_HEADERS`] as owned pairs.
#[must_use]
pub fn hardening_headers() -> Vec<(String, String)> {
    HARDENING_HEADERS
        .iter()
        .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_error_body_omits_missing_code() {
        let json = serde_json::to_value(ErrorBody::new("blocked", "Access denied")).unwrap();
        assert_eq!(json, serde_json::json!({"error": "blocked", "message": "Access denied"}));

        let json = serde_json::to_value(ErrorBody::new("blocked", "x").with_code("HIGH_RISK")).unwrap();
        assert_eq!(json["code"], "HIGH_RISK");
    }

    #[test]
    fn test_rate_limit_headers() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 100,
            count: 7,
            remaining: 93,
            reset_at: Utc.timestamp_opt(1_700_000_060, 0).unwrap(),
            window_secs: 60,
        };
        let headers = rate_limit_headers(&decision);
        assert!(headers.contains(&("x-ratelimit-limit".into(), "100".into())));
        assert!(headers.contains(&("x-ratelimit-remaining".into(), "93".into())));
        assert!(headers.contains(&("x-ratelimit-reset".into(), "1700000060".into())));
    }

    #[test]
    fn test_hardening_header_names_are_lowercase() {
        for (name, _) in hardening_headers() {
            assert_eq!(name, name.to_ascii_lowercase());
        }
    }
}
