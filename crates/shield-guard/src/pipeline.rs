//! Per-request admission pipeline.
//!
//! Stages run in a fixed order and the first conclusive one decides:
//!
//! 1. admin whitelist → allow
//! 2. blacklist → 403
//! 3. geography → configured status (451 by default)
//! 4. VPN/proxy/Tor → 403
//! 5. rate limit → 429 with `Retry-After`
//! 6. risk score → 403, or a challenge flag on an allowed request
//!
//! Degraded signals (store outage, provider failure, stage timeout) never deny
//! a request on their own.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{SecurityAuditLog, SecurityEventType, SecurityLogEntry};
use crate::blacklist::Blacklist;
use crate::config::GuardConfig;
use crate::error::{GuardError, GuardResult};
use crate::geo::GeoResolver;
use crate::identity::ClientIdentity;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::request::RequestInfo;
use crate::response::{ErrorBody, hardening_headers, rate_limit_headers};
use crate::risk::RiskScorer;
use crate::store::{CounterStore, FallbackStore, connect_store};
use crate::vpn::VpnResolver;

/// Stage that settled a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Admin identity, nothing else evaluated.
    Whitelist,
    /// Active blacklist entry.
    Blacklist,
    /// Geographic filter.
    Geo,
    /// VPN/proxy detection.
    Vpn,
    /// Request rate limit.
    RateLimit,
    /// Heuristic risk score.
    Risk,
    /// Every stage passed.
    Passed,
}

/// Outcome of [`AdmissionPipeline::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// HTTP status for a denial, 200 when allowed.
    pub status: u16,
    /// Stage that settled the decision.
    pub stage: Stage,
    /// JSON error body for a denial.
    pub body: Option<ErrorBody>,
    /// Response headers to attach, names in lower case.
    pub headers: Vec<(String, String)>,
    /// Resolved client identity.
    pub identity: ClientIdentity,
    /// The request should be challenged downstream.
    pub challenge_required: bool,
    /// Risk score, when the risk stage ran.
    pub risk_score: Option<u8>,
    /// Country code, when the geo stage resolved one.
    pub country: Option<String>,
}

impl AdmissionDecision {
    fn allow(identity: ClientIdentity, stage: Stage, mut headers: Vec<(String, String)>) -> Self {
        headers.extend(hardening_headers());
        Self {
            allowed: true,
            status: 200,
            stage,
            body: None,
            headers,
            identity,
            challenge_required: false,
            risk_score: None,
            country: None,
        }
    }

    fn deny(identity: ClientIdentity, stage: Stage, status: u16, body: ErrorBody) -> Self {
        Self {
            allowed: false,
            status,
            stage,
            body: Some(body),
            headers: Vec::new(),
            identity,
            challenge_required: false,
            risk_score: None,
            country: None,
        }
    }

    /// Look up a response header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Shared components of the pipeline, built once per process.
#[derive(Debug, Clone)]
pub struct GuardComponents {
    /// Counter/record store with memory fallback.
    pub store: Arc<FallbackStore>,
    /// Request rate limiter.
    pub rate_limiter: Arc<RateLimiter>,
    /// Identity blacklist.
    pub blacklist: Arc<Blacklist>,
    /// Geo resolver.
    pub geo: Arc<GeoResolver>,
    /// VPN resolver.
    pub vpn: Arc<VpnResolver>,
    /// Audit log.
    pub audit: Arc<SecurityAuditLog>,
}

impl GuardComponents {
    /// Build every component from configuration.
    ///
    /// The external store is tried once here; failure selects memory.
    pub async fn build(config: &GuardConfig) -> GuardResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("shield-guard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GuardError::Config(format!("http client: {e}")))?;

        let store = connect_store(&config.store).await;
        let geo = GeoResolver::with_default_providers(&config.geo, client.clone());
        let vpn = VpnResolver::from_config(&config.vpn, &client);
        let audit = SecurityAuditLog::from_config(&config.audit, &client);

        info!(
            backend = store.backend_name(),
            vpn_providers = vpn.provider_count(),
            geo_enabled = config.geo.enabled,
            vpn_enabled = config.vpn.enabled,
            "admission components ready"
        );
        Ok(Self::from_parts(config, store, geo, vpn, audit))
    }

    /// Assemble components around explicit resolvers and store.
    #[must_use]
    pub fn from_parts(
        config: &GuardConfig,
        store: Arc<FallbackStore>,
        geo: GeoResolver,
        vpn: VpnResolver,
        audit: SecurityAuditLog,
    ) -> Self {
        let shared: Arc<dyn CounterStore> = store.clone();
        Self {
            rate_limiter: Arc::new(RateLimiter::new(Arc::clone(&shared), config.rate_limit.clone())),
            blacklist: Arc::new(Blacklist::new(shared, config.blacklist.clone())),
            store,
            geo: Arc::new(geo),
            vpn: Arc::new(vpn),
            audit: Arc::new(audit),
        }
    }
}

/// Orchestrates the admission stages for each request.
#[derive(Debug, Clone)]
pub struct AdmissionPipeline {
    config: Arc<GuardConfig>,
    components: GuardComponents,
    risk: RiskScorer,
}

impl AdmissionPipeline {
    /// Create a pipeline over built components.
    #[must_use]
    pub fn new(config: GuardConfig, components: GuardComponents) -> Self {
        Self {
            risk: RiskScorer::new(config.risk.clone()),
            config: Arc::new(config),
            components,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Shared components.
    #[must_use]
    pub fn components(&self) -> &GuardComponents {
        &self.components
    }

    fn entry(
        event_type: SecurityEventType,
        identity: &ClientIdentity,
        request: &RequestInfo,
        country: Option<&str>,
    ) -> SecurityLogEntry {
        SecurityLogEntry::new(event_type, identity.as_str(), request.path.as_str())
            .with_country(country)
            .with_user_agent(request.user_agent())
    }

    /// Decide whether a request may proceed.
    pub async fn evaluate(&self, request: &RequestInfo) -> AdmissionDecision {
        let identity = ClientIdentity::from_request(request);

        if self.config.is_admin(identity.as_str()) {
            debug!(ip = %identity, "admin identity, bypassing admission checks");
            return AdmissionDecision::allow(identity, Stage::Whitelist, Vec::new());
        }

        if let Some(decision) = self.check_blacklist(&identity, request).await {
            return decision;
        }

        let mut country = None;
        if self.config.geo.enabled && !self.config.is_geo_whitelisted(identity.as_str()) {
            match self.check_geo(&identity, request).await {
                Ok(resolved) => country = resolved,
                Err(decision) => return *decision,
            }
        }

        if self.config.vpn.enabled {
            if let Some(mut decision) = self.check_vpn(&identity, request, country.as_deref()).await {
                decision.country = country;
                return decision;
            }
        }

        let rate = self.components.rate_limiter.check_limit(&identity).await;
        if !rate.allowed {
            let mut decision = self.rate_limited(&identity, request, &rate, country.as_deref()).await;
            decision.country = country;
            return decision;
        }

        let assessment = self.risk.assess(request, !rate.allowed);
        if assessment.score >= self.config.risk.auto_blacklist_threshold {
            self.auto_blacklist(&identity, request, assessment.score, country.as_deref());
        }

        if assessment.blocked {
            self.components.audit.record(
                Self::entry(SecurityEventType::DdosBlock, &identity, request, country.as_deref())
                    .with_reason("high risk score")
                    .with_risk_score(assessment.score)
                    .with_metadata("reasons", serde_json::json!(assessment.reasons)),
            );
            let mut decision = AdmissionDecision::deny(
                identity,
                Stage::Risk,
                403,
                ErrorBody::new("blocked", "Request blocked by security policy.").with_code("HIGH_RISK"),
            );
            decision.risk_score = Some(assessment.score);
            decision.country = country;
            return decision;
        }

        if assessment.challenge_required {
            self.components.audit.record(
                Self::entry(SecurityEventType::Challenge, &identity, request, country.as_deref())
                    .with_reason("elevated risk score")
                    .with_risk_score(assessment.score)
                    .with_metadata("reasons", serde_json::json!(assessment.reasons)),
            );
        }

        let mut decision = AdmissionDecision::allow(identity, Stage::Passed, rate_limit_headers(&rate));
        decision.challenge_required = assessment.challenge_required;
        decision.risk_score = Some(assessment.score);
        decision.country = country;
        decision
    }

    async fn check_blacklist(
        &self,
        identity: &ClientIdentity,
        request: &RequestInfo,
    ) -> Option<AdmissionDecision> {
        let entry = match self.components.blacklist.get(identity).await {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(ip = %identity, error = %err, "blacklist stage failed, allowing");
                return None;
            }
        };
        if !entry.is_blocking_at(Utc::now()) {
            return None;
        }

        self.components.audit.record(
            Self::entry(SecurityEventType::DdosBlock, identity, request, None)
                .with_reason(format!("blacklisted: {}", entry.reason))
                .with_metadata("violation_count", serde_json::json!(entry.violation_count)),
        );
        Some(AdmissionDecision::deny(
            identity.clone(),
            Stage::Blacklist,
            403,
            ErrorBody::new("blocked", "Access denied.").with_code("BLACKLISTED"),
        ))
    }

    /// `Ok` carries the resolved country; `Err` is a denial.
    async fn check_geo(
        &self,
        identity: &ClientIdentity,
        request: &RequestInfo,
    ) -> Result<Option<String>, Box<AdmissionDecision>> {
        let hint = request.platform_country(&self.config.geo.platform_headers);
        let resolve = self.components.geo.resolve(identity, hint.as_deref());
        let Ok(geo) = tokio::time::timeout(self.config.stage_timeout, resolve).await else {
            let err = GuardError::StageTimeout {
                stage: "geo",
                after: self.config.stage_timeout,
            };
            warn!(ip = %identity, error = %err, "geo stage skipped");
            return Ok(None);
        };

        match geo.country_code {
            Some(country) if !geo.is_european => {
                self.components.audit.record(
                    Self::entry(SecurityEventType::Geoblock, identity, request, Some(&country))
                        .with_reason(format!("non-European country {country}"))
                        .with_metadata("source", serde_json::json!(geo.source)),
                );
                let mut decision = AdmissionDecision::deny(
                    identity.clone(),
                    Stage::Geo,
                    self.config.geo.deny_status,
                    ErrorBody::new("geo_blocked", self.config.geo.deny_message.clone())
                        .with_code("GEO_BLOCKED"),
                );
                decision.country = Some(country);
                Err(Box::new(decision))
            }
            country => Ok(country),
        }
    }

    async fn check_vpn(
        &self,
        identity: &ClientIdentity,
        request: &RequestInfo,
        country: Option<&str>,
    ) -> Option<AdmissionDecision> {
        let threshold = self.config.vpn.confidence_threshold;
        let lookup = self.components.vpn.should_block(identity, threshold);
        let Ok(decision) = tokio::time::timeout(self.config.stage_timeout, lookup).await else {
            let err = GuardError::StageTimeout {
                stage: "vpn",
                after: self.config.stage_timeout,
            };
            warn!(ip = %identity, error = %err, "VPN stage skipped");
            return None;
        };

        let result = &decision.result;
        let reason = if decision.block {
            "VPN or proxy detected"
        } else if self.config.vpn.block_tor && result.is_tor {
            "Tor exit node"
        } else if self.config.vpn.block_datacenter
            && result.is_datacenter
            && result.confidence >= threshold
        {
            "datacenter address"
        } else {
            return None;
        };

        self.components.audit.record(
            Self::entry(SecurityEventType::VpnBlock, identity, request, country)
                .with_reason(reason)
                .with_metadata("confidence", serde_json::json!(result.confidence))
                .with_metadata("source", serde_json::json!(result.source))
                .with_metadata("provider", serde_json::json!(result.provider)),
        );
        Some(AdmissionDecision::deny(
            identity.clone(),
            Stage::Vpn,
            403,
            ErrorBody::new("vpn_blocked", "VPN and proxy connections are not allowed.")
                .with_code("VPN_BLOCKED"),
        ))
    }

    async fn rate_limited(
        &self,
        identity: &ClientIdentity,
        request: &RequestInfo,
        rate: &RateLimitDecision,
        country: Option<&str>,
    ) -> AdmissionDecision {
        let retry_after = rate.retry_after_secs();
        self.components.audit.record(
            Self::entry(SecurityEventType::RateLimit, identity, request, country)
                .with_reason("rate limit exceeded")
                .with_metadata("count", serde_json::json!(rate.count))
                .with_metadata("limit", serde_json::json!(rate.limit)),
        );

        if self.config.escalate_rate_limit_violations {
            match self
                .components
                .blacklist
                .record_violation(identity, "repeated rate limit violations")
                .await
            {
                Ok(true) => info!(ip = %identity, "rate limit violations escalated to a block"),
                Ok(false) => {}
                Err(err) => warn!(ip = %identity, error = %err, "failed to record violation"),
            }
        }

        let mut decision = AdmissionDecision::deny(
            identity.clone(),
            Stage::RateLimit,
            429,
            ErrorBody::new("rate_limited", "Too many requests, please try again later.")
                .with_code("RATE_LIMITED"),
        );
        decision.headers = rate_limit_headers(rate);
        decision.headers.push(("retry-after".into(), retry_after.to_string()));
        decision
    }

    fn auto_blacklist(
        &self,
        identity: &ClientIdentity,
        request: &RequestInfo,
        score: u8,
        country: Option<&str>,
    ) {
        self.components.audit.record(
            Self::entry(SecurityEventType::Blacklisted, identity, request, country)
                .with_reason("risk score above auto-blacklist threshold")
                .with_risk_score(score),
        );

        let blacklist = Arc::clone(&self.components.blacklist);
        let identity = identity.clone();
        tokio::spawn(async move {
            let reason = format!("automatic: risk score {score}");
            if let Err(err) = blacklist.add_default(&identity, reason).await {
                warn!(ip = %identity, error = %err, "automatic blacklisting failed");
            }
        });
    }
}
