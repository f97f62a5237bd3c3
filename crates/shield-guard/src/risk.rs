//! Heuristic request risk scoring.
//!
//! Three independent sub-scores (user agent, request signature, cookies), each
//! capped at 100, are combined as
//! `round(0.3 * ua + 0.3 * signature + 0.2 * cookie) + 40 * rate_limited`,
//! clamped to `0..=100`. Missing headers map to higher scores, never errors.

use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;
use crate::request::RequestInfo;

/// Substrings of scripted or automated HTTP clients.
const BOT_PATTERNS: [&str; 16] = [
    "curl",
    "wget",
    "python",
    "bot",
    "crawler",
    "spider",
    "scraper",
    "go-http-client",
    "java/",
    "okhttp",
    "axios",
    "node-fetch",
    "libwww-perl",
    "php/",
    "ruby",
    "httpclient",
];

/// Substrings present in every mainstream browser user agent.
const BROWSER_PATTERNS: [&str; 6] = ["mozilla", "chrome", "safari", "firefox", "edg", "opera"];

/// Largest body that is not considered suspicious.
const MAX_CONTENT_LENGTH: u64 = 10 * 1024 * 1024;

const RATE_LIMIT_PENALTY: u32 = 40;
const MAX_SCORE: u32 = 100;

/// Scored view of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Composite score, 0-100.
    pub score: u8,
    /// User-agent sub-score.
    pub user_agent_score: u8,
    /// Request-signature sub-score.
    pub signature_score: u8,
    /// Cookie sub-score.
    pub cookie_score: u8,
    /// Whether the rate limit was exceeded.
    pub rate_limit_exceeded: bool,
    /// Score reached the block threshold.
    pub blocked: bool,
    /// Score reached the challenge threshold without being blocked.
    pub challenge_required: bool,
    /// Human-readable contributing factors.
    pub reasons: Vec<String>,
}

/// Stateless risk scorer.
#[derive(Debug, Clone, Default)]
pub struct RiskScorer {
    config: RiskConfig,
}

impl RiskScorer {
    /// Create a scorer.
    #[must_use]
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Score a request.
    #[must_use]
    pub fn assess(&self, request: &RequestInfo, rate_limit_exceeded: bool) -> RiskAssessment {
        let mut reasons = Vec::new();
        let ua = user_agent_score(request.user_agent(), &mut reasons);
        let signature = signature_score(request, &mut reasons);
        let cookie = self.cookie_score(request, &mut reasons);

        let mut score = (3 * ua + 3 * signature + 2 * cookie + 5) / 10;
        if rate_limit_exceeded {
            score += RATE_LIMIT_PENALTY;
            reasons.push("rate limit exceeded".to_string());
        }
        let score = score.min(MAX_SCORE) as u8;

        let blocked = score >= self.config.block_threshold;
        RiskAssessment {
            score,
            user_agent_score: ua as u8,
            signature_score: signature as u8,
            cookie_score: cookie as u8,
            rate_limit_exceeded,
            blocked,
            challenge_required: !blocked && score >= self.config.challenge_threshold,
            reasons,
        }
    }

    fn cookie_score(&self, request: &RequestInfo, reasons: &mut Vec<String>) -> u32 {
        let protected = self
            .config
            .protected_prefixes
            .iter()
            .any(|prefix| request.path.starts_with(prefix.as_str()));
        if !protected {
            return 0;
        }
        let has_session = self
            .config
            .session_cookies
            .iter()
            .any(|name| request.has_cookie(name));
        if has_session {
            0
        } else {
            reasons.push(format!("no session cookie on protected path {}", request.path));
            20
        }
    }
}

fn user_agent_score(user_agent: Option<&str>, reasons: &mut Vec<String>) -> u32 {
    let Some(ua) = user_agent.map(str::trim).filter(|ua| !ua.is_empty()) else {
        reasons.push("missing user agent".to_string());
        return 30;
    };

    let mut score = 0;
    if ua.len() < 10 {
        score += 20;
        reasons.push("short user agent".to_string());
    }

    let lower = ua.to_ascii_lowercase();
    for pattern in BOT_PATTERNS.iter().filter(|p| lower.contains(**p)) {
        score += 15;
        reasons.push(format!("automated client pattern: {pattern}"));
    }
    if !BROWSER_PATTERNS.iter().any(|p| lower.contains(p)) {
        score += 25;
        reasons.push("no browser signature".to_string());
    }

    score.min(MAX_SCORE)
}

fn signature_score(request: &RequestInfo, reasons: &mut Vec<String>) -> u32 {
    let mut score = 0;

    match request.header("accept").map(str::trim) {
        None | Some("" | "*/*") => {
            score += 10;
            reasons.push("missing or wildcard Accept".to_string());
        }
        Some(_) => {}
    }
    if request.header("accept-language").is_none() {
        score += 5;
        reasons.push("missing Accept-Language".to_string());
    }
    if request.header("accept-encoding").is_none() {
        score += 5;
        reasons.push("missing Accept-Encoding".to_string());
    }
    if let Some(connection) = request.header("connection") {
        if !connection.trim().eq_ignore_ascii_case("keep-alive") {
            score += 10;
            reasons.push(format!("unusual Connection: {connection}"));
        }
    }
    if request.method == "POST" && request.header("referer").is_none() {
        score += 15;
        reasons.push("POST without Referer".to_string());
    }
    if let Some(raw) = request.header("content-length") {
        let suspicious = raw
            .trim()
            .parse::<u64>()
            .map_or(true, |len| len == 0 || len > MAX_CONTENT_LENGTH);
        if suspicious {
            score += 10;
            reasons.push(format!("suspicious Content-Length: {raw}"));
        }
    }

    score.min(MAX_SCORE)
}
