//! Admission pipeline configuration.
//!
//! Every knob has a default; [`GuardConfig::from_env`] overlays the
//! environment-style keys recognized by the deployment, and
//! [`GuardConfig::validate`] rejects malformed values before the pipeline is
//! built so nothing has to be checked per request.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, GuardResult};
use crate::geo::EUROPEAN_COUNTRIES;
use crate::vpn::KNOWN_VPN_BRANDS;

/// Configuration for request rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per window per client.
    pub max_requests: u32,
    /// Fixed window length.
    pub window: Duration,
    /// Whether to enable rate limiting.
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Configuration for the client blacklist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// TTL for explicit blocks.
    pub default_ttl: Duration,
    /// TTL for provisional (watch) entries created by a single violation.
    pub provisional_ttl: Duration,
    /// TTL applied when repeated violations promote an entry to a block.
    pub promotion_ttl: Duration,
    /// Violations needed before promotion.
    pub violation_threshold: u32,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(86_400),
            provisional_ttl: Duration::from_secs(3_600),
            promotion_ttl: Duration::from_secs(86_400),
            violation_threshold: 3,
        }
    }
}

/// Configuration for geographic filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    /// Whether non-European traffic is denied.
    pub enabled: bool,
    /// HTTP status used for geo denials (451 or 403).
    pub deny_status: u16,
    /// Message returned with geo denials.
    pub deny_message: String,
    /// `is_european` value reported when no provider could answer.
    ///
    /// Defaults to `true`: inconclusive geography is permitted rather than
    /// risking a block of legitimate European traffic.
    pub fallback_allows: bool,
    /// Country codes treated as European.
    pub european_countries: HashSet<String>,
    /// Identities exempt from the geo stage only.
    pub whitelist: HashSet<String>,
    /// Request headers carrying a platform-supplied country code, in order.
    pub platform_headers: Vec<String>,
    /// Timeout applied to each external geo lookup.
    pub provider_timeout: Duration,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            deny_status: 451,
            deny_message: "This service is only available in Europe.".into(),
            fallback_allows: true,
            european_countries: EUROPEAN_COUNTRIES.iter().map(|c| (*c).to_string()).collect(),
            whitelist: HashSet::new(),
            platform_headers: vec!["cf-ipcountry".into(), "x-vercel-ip-country".into()],
            provider_timeout: Duration::from_secs(3),
        }
    }
}

/// Configuration for VPN/proxy detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Whether the VPN stage runs.
    pub enabled: bool,
    /// Minimum fused confidence before a VPN/proxy/Tor signal blocks.
    pub confidence_threshold: u8,
    /// Additionally deny datacenter addresses at or above the threshold.
    pub block_datacenter: bool,
    /// Additionally deny Tor exits regardless of confidence.
    pub block_tor: bool,
    /// Timeout applied to each provider call.
    pub provider_timeout: Duration,
    /// Case-insensitive ISP/provider substrings of commercial VPN brands.
    pub known_vpn_brands: Vec<String>,
    /// proxycheck.io API key.
    pub proxycheck_api_key: Option<String>,
    /// ipqualityscore.com API key.
    pub ipqualityscore_api_key: Option<String>,
    /// iphub.info API key.
    pub iphub_api_key: Option<String>,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: 50,
            block_datacenter: false,
            block_tor: true,
            provider_timeout: Duration::from_secs(3),
            known_vpn_brands: KNOWN_VPN_BRANDS.iter().map(|b| (*b).to_string()).collect(),
            proxycheck_api_key: None,
            ipqualityscore_api_key: None,
            iphub_api_key: None,
        }
    }
}

/// Configuration for heuristic risk scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Score at which a challenge is flagged.
    pub challenge_threshold: u8,
    /// Score at which the request is denied.
    pub block_threshold: u8,
    /// Score at which the identity is added to the blacklist.
    pub auto_blacklist_threshold: u8,
    /// Path prefixes of authenticated features.
    pub protected_prefixes: Vec<String>,
    /// Cookie names that count as a session/auth token.
    pub session_cookies: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            challenge_threshold: 60,
            block_threshold: 80,
            auto_blacklist_threshold: 90,
            protected_prefixes: vec!["/profile".into(), "/chat".into()],
            session_cookies: vec![
                "session".into(),
                "__session".into(),
                "auth-token".into(),
                "next-auth.session-token".into(),
                "__Secure-next-auth.session-token".into(),
            ],
        }
    }
}

/// Configuration for the counter store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// External store URL; `None` selects the in-memory store.
    pub redis_url: Option<String>,
    /// Prefix for every external key.
    pub namespace: String,
    /// Budget for the initial connection attempt.
    pub connect_timeout: Duration,
    /// Budget for each store command.
    pub command_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: "shield".into(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(500),
        }
    }
}

/// Configuration for the security audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Ring buffer capacity.
    pub capacity: usize,
    /// Optional log-ingestion endpoint; entries are posted best-effort.
    pub ingest_url: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ingest_url: None,
        }
    }
}

/// Main admission pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Rate limiting settings.
    pub rate_limit: RateLimitConfig,
    /// Blacklist settings.
    pub blacklist: BlacklistConfig,
    /// Geographic filtering settings.
    pub geo: GeoConfig,
    /// VPN detection settings.
    pub vpn: VpnConfig,
    /// Risk scoring settings.
    pub risk: RiskConfig,
    /// Counter store settings.
    pub store: StoreConfig,
    /// Audit log settings.
    pub audit: AuditConfig,
    /// Identities that bypass every stage.
    pub admin_ips: HashSet<String>,
    /// Budget for the geo and VPN stages.
    pub stage_timeout: Duration,
    /// Record a blacklist violation each time the rate limit denies a request.
    pub escalate_rate_limit_violations: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            blacklist: BlacklistConfig::default(),
            geo: GeoConfig::default(),
            vpn: VpnConfig::default(),
            risk: RiskConfig::default(),
            store: StoreConfig::default(),
            audit: AuditConfig::default(),
            admin_ips: HashSet::new(),
            stage_timeout: Duration::from_secs(5),
            escalate_rate_limit_violations: true,
        }
    }
}

impl GuardConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::default()
    }

    /// Load from the process environment and validate.
    pub fn from_env() -> GuardResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment in production,
    /// a map in tests) and validate.
    pub fn from_lookup<F>(lookup: F) -> GuardResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(v) = get("RATE_LIMIT_WINDOW_MS") {
            config.rate_limit.window = Duration::from_millis(parse_value("RATE_LIMIT_WINDOW_MS", &v)?);
        }
        if let Some(v) = get("RATE_LIMIT_MAX_REQUESTS") {
            config.rate_limit.max_requests = parse_value("RATE_LIMIT_MAX_REQUESTS", &v)?;
        }
        if let Some(v) = get("RATE_LIMIT_ENABLED") {
            config.rate_limit.enabled = parse_bool("RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = get("DDOS_BLOCK_THRESHOLD") {
            config.risk.block_threshold = parse_value("DDOS_BLOCK_THRESHOLD", &v)?;
        }
        if let Some(v) = get("DDOS_CHALLENGE_THRESHOLD") {
            config.risk.challenge_threshold = parse_value("DDOS_CHALLENGE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("DDOS_AUTO_BLACKLIST_THRESHOLD") {
            config.risk.auto_blacklist_threshold = parse_value("DDOS_AUTO_BLACKLIST_THRESHOLD", &v)?;
        }
        if let Some(v) = get("GEO_BLOCKING_ENABLED") {
            config.geo.enabled = parse_bool("GEO_BLOCKING_ENABLED", &v)?;
        }
        if let Some(v) = get("GEO_BLOCK_STATUS") {
            config.geo.deny_status = parse_value("GEO_BLOCK_STATUS", &v)?;
        }
        if let Some(v) = get("GEO_BLOCK_MESSAGE") {
            config.geo.deny_message = v;
        }
        if let Some(v) = get("GEO_FALLBACK_ALLOW") {
            config.geo.fallback_allows = parse_bool("GEO_FALLBACK_ALLOW", &v)?;
        }
        if let Some(v) = get("GEO_WHITELIST") {
            config.geo.whitelist = parse_list(&v).collect();
        }
        if let Some(v) = get("VPN_DETECTION_ENABLED") {
            config.vpn.enabled = parse_bool("VPN_DETECTION_ENABLED", &v)?;
        }
        if let Some(v) = get("VPN_CONFIDENCE_THRESHOLD") {
            config.vpn.confidence_threshold = parse_value("VPN_CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("VPN_BLOCK_DATACENTER") {
            config.vpn.block_datacenter = parse_bool("VPN_BLOCK_DATACENTER", &v)?;
        }
        if let Some(v) = get("VPN_BLOCK_TOR") {
            config.vpn.block_tor = parse_bool("VPN_BLOCK_TOR", &v)?;
        }
        config.vpn.proxycheck_api_key = get("PROXYCHECK_API_KEY");
        config.vpn.ipqualityscore_api_key = get("IPQUALITYSCORE_API_KEY");
        config.vpn.iphub_api_key = get("IPHUB_API_KEY");
        config.store.redis_url = get("REDIS_URL");
        if let Some(v) = get("ADMIN_IPS") {
            config.admin_ips = parse_list(&v).collect();
        }
        config.audit.ingest_url = get("SECURITY_LOG_INGEST_URL");
        if let Some(v) = get("SECURITY_LOG_CAPACITY") {
            config.audit.capacity = parse_value("SECURITY_LOG_CAPACITY", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&self) -> GuardResult<()> {
        if self.rate_limit.max_requests == 0 {
            return Err(GuardError::Config("rate limit max_requests must be > 0".into()));
        }
        if self.rate_limit.window.is_zero() {
            return Err(GuardError::Config("rate limit window must be > 0".into()));
        }
        for (name, value) in [
            ("block_threshold", self.risk.block_threshold),
            ("challenge_threshold", self.risk.challenge_threshold),
            ("auto_blacklist_threshold", self.risk.auto_blacklist_threshold),
            ("vpn confidence_threshold", self.vpn.confidence_threshold),
        ] {
            if value > 100 {
                return Err(GuardError::Config(format!("{name} must be <= 100, got {value}")));
            }
        }
        if self.risk.challenge_threshold >= self.risk.block_threshold {
            return Err(GuardError::Config(format!(
                "challenge_threshold ({}) must be below block_threshold ({})",
                self.risk.challenge_threshold, self.risk.block_threshold
            )));
        }
        if !(400..=599).contains(&self.geo.deny_status) {
            return Err(GuardError::Config(format!(
                "geo deny_status must be a 4xx/5xx status, got {}",
                self.geo.deny_status
            )));
        }
        if self.blacklist.violation_threshold == 0 {
            return Err(GuardError::Config("blacklist violation_threshold must be > 0".into()));
        }
        if self.audit.capacity == 0 {
            return Err(GuardError::Config("audit capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Check if an identity bypasses all stages.
    #[must_use]
    pub fn is_admin(&self, identity: &str) -> bool {
        self.admin_ips.contains(identity)
    }

    /// Check if an identity is exempt from geo filtering.
    #[must_use]
    pub fn is_geo_whitelisted(&self, identity: &str) -> bool {
        self.geo.whitelist.contains(identity)
    }
}

/// Builder for `GuardConfig`.
#[derive(Debug, Clone, Default)]
pub struct GuardConfigBuilder {
    config: GuardConfig,
}

impl GuardConfigBuilder {
    /// Set rate limit configuration.
    #[must_use]
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Set blacklist configuration.
    #[must_use]
    pub fn blacklist(mut self, config: BlacklistConfig) -> Self {
        self.config.blacklist = config;
        self
    }

    /// Set geographic filtering configuration.
    #[must_use]
    pub fn geo(mut self, config: GeoConfig) -> Self {
        self.config.geo = config;
        self
    }

    /// Set VPN detection configuration.
    #[must_use]
    pub fn vpn(mut self, config: VpnConfig) -> Self {
        self.config.vpn = config;
        self
    }

    /// Set risk scoring configuration.
    #[must_use]
    pub fn risk(mut self, config: RiskConfig) -> Self {
        self.config.risk = config;
        self
    }

    /// Set counter store configuration.
    #[must_use]
    pub fn store(mut self, config: StoreConfig) -> Self {
        self.config.store = config;
        self
    }

    /// Set audit log configuration.
    #[must_use]
    pub fn audit(mut self, config: AuditConfig) -> Self {
        self.config.audit = config;
        self
    }

    /// Add an admin identity.
    #[must_use]
    pub fn admin_ip(mut self, ip: impl Into<String>) -> Self {
        self.config.admin_ips.insert(ip.into());
        self
    }

    /// Set the geo/VPN stage budget.
    #[must_use]
    pub const fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.config.stage_timeout = timeout;
        self
    }

    /// Toggle blacklist escalation on rate-limit denials.
    #[must_use]
    pub const fn escalate_rate_limit_violations(mut self, enabled: bool) -> Self {
        self.config.escalate_rate_limit_violations = enabled;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> GuardConfig {
        self.config
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> GuardResult<T> {
    raw.parse()
        .map_err(|_| GuardError::Config(format!("{key}: cannot parse {raw:?}")))
}

fn parse_bool(key: &str, raw: &str) -> GuardResult<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GuardError::Config(format!("{key}: expected a boolean, got {raw:?}"))),
    }
}

fn parse_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
