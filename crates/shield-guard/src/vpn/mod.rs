//! VPN, proxy, datacenter and Tor detection.
//!
//! Every configured [`VpnProvider`] is queried concurrently, each call under
//! its own timeout. Providers that fail or time out are left out of the
//! fusion; they never count as a "not VPN" vote.

mod providers;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::VpnConfig;
use crate::error::GuardFuture;
use crate::identity::ClientIdentity;

pub use providers::{IpHubProvider, IpQualityScoreProvider, ProxyCheckProvider};

/// ISP/provider name fragments of commercial VPN services, matched
/// case-insensitively.
pub const KNOWN_VPN_BRANDS: [&str; 20] = [
    "nordvpn",
    "expressvpn",
    "surfshark",
    "cyberghost",
    "private internet access",
    "protonvpn",
    "proton ag",
    "mullvad",
    "ipvanish",
    "hotspot shield",
    "windscribe",
    "tunnelbear",
    "purevpn",
    "vyprvpn",
    "hide.me",
    "torguard",
    "astrill",
    "privado",
    "atlas vpn",
    "m247",
];

/// Minimum confidence forced by a known-brand match.
const BRAND_CONFIDENCE: u8 = 95;

/// One provider's normalized answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderVerdict {
    /// Commercial VPN exit.
    pub is_vpn: bool,
    /// Open or anonymous proxy.
    pub is_proxy: bool,
    /// Hosting or datacenter range.
    pub is_datacenter: bool,
    /// Tor exit node.
    pub is_tor: bool,
    /// ISP or operator name, if reported.
    pub provider: Option<String>,
    /// Provider confidence, 0-100.
    pub confidence: u8,
}

/// Fused detection result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnResult {
    /// Any provider saw a VPN, or the ISP is a known VPN brand.
    pub is_vpn: bool,
    /// Any provider saw a proxy.
    pub is_proxy: bool,
    /// Any provider saw a datacenter range.
    pub is_datacenter: bool,
    /// Any provider saw a Tor exit.
    pub is_tor: bool,
    /// First ISP/operator name reported.
    pub provider: Option<String>,
    /// Mean confidence of contributing providers, 0-100.
    pub confidence: u8,
    /// Comma-joined names of contributing providers.
    pub source: String,
}

impl VpnResult {
    /// Result used when no provider answered.
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            is_vpn: false,
            is_proxy: false,
            is_datacenter: false,
            is_tor: false,
            provider: None,
            confidence: 0,
            source: String::new(),
        }
    }

    /// Whether any anonymizing signal is present.
    #[must_use]
    pub fn is_anonymized(&self) -> bool {
        self.is_vpn || self.is_proxy || self.is_tor
    }
}

/// Result of [`VpnResolver::should_block`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnDecision {
    /// Anonymized and at or above the threshold.
    pub block: bool,
    /// The fused result.
    pub result: VpnResult,
}

/// Third-party VPN/proxy detection service.
pub trait VpnProvider: Send + Sync {
    /// Provider name, used in [`VpnResult::source`].
    fn name(&self) -> &'static str;

    /// Query the provider for an address.
    fn lookup(&self, ip: IpAddr) -> GuardFuture<'_, ProviderVerdict>;
}

/// Combine provider verdicts.
///
/// Flags are OR-reduced, confidence is the rounded mean, and a known VPN
/// brand in any reported ISP forces `is_vpn` with confidence of at least 95.
#[must_use]
pub fn fuse(verdicts: &[(&str, ProviderVerdict)], known_brands: &[String]) -> VpnResult {
    if verdicts.is_empty() {
        return VpnResult::neutral();
    }

    let mut result = VpnResult::neutral();
    let mut total: u32 = 0;
    for (_, verdict) in verdicts {
        result.is_vpn |= verdict.is_vpn;
        result.is_proxy |= verdict.is_proxy;
        result.is_datacenter |= verdict.is_datacenter;
        result.is_tor |= verdict.is_tor;
        total += u32::from(verdict.confidence.min(100));
        if result.provider.is_none() {
            result.provider.clone_from(&verdict.provider);
        }
    }
    let count = verdicts.len() as u32;
    result.confidence = ((total * 2 + count) / (count * 2)) as u8;
    result.source = verdicts
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(",");

    let brand_match = verdicts
        .iter()
        .filter_map(|(_, v)| v.provider.as_deref())
        .any(|isp| matches_brand(isp, known_brands));
    if brand_match {
        result.is_vpn = true;
        result.confidence = result.confidence.max(BRAND_CONFIDENCE);
    }

    result
}

fn matches_brand(isp: &str, known_brands: &[String]) -> bool {
    let isp = isp.to_ascii_lowercase();
    known_brands
        .iter()
        .any(|brand| !brand.is_empty() && isp.contains(brand.as_str()))
}

/// Queries all configured providers and fuses their answers.
pub struct VpnResolver {
    providers: Vec<Arc<dyn VpnProvider>>,
    known_brands: Vec<String>,
    provider_timeout: Duration,
}

impl std::fmt::Debug for VpnResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpnResolver")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("provider_timeout", &self.provider_timeout)
            .finish_non_exhaustive()
    }
}

impl VpnResolver {
    /// Create a resolver over explicit providers.
    #[must_use]
    pub fn new(config: &VpnConfig, providers: Vec<Arc<dyn VpnProvider>>) -> Self {
        Self {
            providers,
            known_brands: config
                .known_vpn_brands
                .iter()
                .map(|b| b.to_ascii_lowercase())
                .collect(),
            provider_timeout: config.provider_timeout,
        }
    }

    /// Create a resolver with every provider whose API key is configured.
    #[must_use]
    pub fn from_config(config: &VpnConfig, client: &reqwest::Client) -> Self {
        let timeout = config.provider_timeout;
        let mut providers: Vec<Arc<dyn VpnProvider>> = Vec::new();
        if let Some(key) = &config.proxycheck_api_key {
            providers.push(Arc::new(ProxyCheckProvider::new(client.clone(), key.clone(), timeout)));
        }
        if let Some(key) = &config.ipqualityscore_api_key {
            providers.push(Arc::new(IpQualityScoreProvider::new(
                client.clone(),
                key.clone(),
                timeout,
            )));
        }
        if let Some(key) = &config.iphub_api_key {
            providers.push(Arc::new(IpHubProvider::new(client.clone(), key.clone(), timeout)));
        }
        if providers.is_empty() {
            debug!("no VPN provider keys configured");
        }
        Self::new(config, providers)
    }

    /// Number of configured providers.
    #[must_use]
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Query every provider concurrently and fuse the answers.
    pub async fn resolve(&self, identity: &ClientIdentity) -> VpnResult {
        if self.providers.is_empty() {
            return VpnResult::neutral();
        }
        let Some(ip) = identity.as_ip().filter(|_| identity.is_routable()) else {
            debug!(ip = %identity, "non-routable identity, skipping VPN lookup");
            return VpnResult::neutral();
        };

        let calls = self.providers.iter().map(|provider| async move {
            let outcome = tokio::time::timeout(self.provider_timeout, provider.lookup(ip)).await;
            (provider.name(), outcome)
        });

        let mut verdicts = Vec::with_capacity(self.providers.len());
        for (name, outcome) in join_all(calls).await {
            match outcome {
                Ok(Ok(verdict)) => verdicts.push((name, verdict)),
                Ok(Err(err)) => warn!(ip = %identity, provider = name, error = %err, "VPN provider failed"),
                Err(_) => warn!(
                    ip = %identity,
                    provider = name,
                    timeout_ms = self.provider_timeout.as_millis() as u64,
                    "VPN provider timed out"
                ),
            }
        }

        let result = fuse(&verdicts, &self.known_brands);
        debug!(
            ip = %identity,
            is_vpn = result.is_vpn,
            confidence = result.confidence,
            source = %result.source,
            "VPN resolution complete"
        );
        result
    }

    /// Resolve and decide whether the anonymizing signal is strong enough.
    pub async fn should_block(&self, identity: &ClientIdentity, threshold: u8) -> VpnDecision {
        let result = self.resolve(identity).await;
        VpnDecision {
            block: result.is_anonymized() && result.confidence >= threshold,
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Verdict(ProviderVerdict),
        Fail,
        Hang,
    }

    struct FakeVpn {
        name: &'static str,
        script: Script,
        calls: AtomicUsize,
    }

    impl FakeVpn {
        fn arc(name: &'static str, script: Script) -> Arc<dyn VpnProvider> {
            Arc::new(Self {
                name,
                script,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl VpnProvider for FakeVpn {
        fn name(&self) -> &'static str {
            self.name
        }

        fn lookup(&self, _ip: IpAddr) -> GuardFuture<'_, ProviderVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match &self.script {
                    Script::Verdict(v) => Ok(v.clone()),
                    Script::Fail => Err(GuardError::provider(self.name, "HTTP 500")),
                    Script::Hang => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(ProviderVerdict::default())
                    }
                }
            })
        }
    }

    fn verdict(is_vpn: bool, confidence: u8) -> ProviderVerdict {
        ProviderVerdict {
            is_vpn,
            confidence,
            ..ProviderVerdict::default()
        }
    }

    fn config() -> VpnConfig {
        VpnConfig {
            provider_timeout: Duration::from_millis(50),
            ..VpnConfig::default()
        }
    }

    fn public_ip() -> ClientIdentity {
        ClientIdentity::new("8.8.4.4")
    }

    #[test]
    fn test_fuse_or_and_mean() {
        let result = fuse(&[("a", verdict(true, 60)), ("b", verdict(false, 20))], &[]);
        assert!(result.is_vpn);
        assert_eq!(result.confidence, 40);
        assert_eq!(result.source, "a,b");
    }

    #[test]
    fn test_fuse_rounds_mean() {
        let result = fuse(
            &[("a", verdict(false, 50)), ("b", verdict(false, 51)), ("c", verdict(false, 0))],
            &[],
        );
        // 101 / 3 = 33.67
        assert_eq!(result.confidence, 34);
    }

    #[test]
    fn test_fuse_empty_is_neutral() {
        let result = fuse(&[], &[]);
        assert_eq!(result, VpnResult::neutral());
        assert!(!result.is_vpn);
        assert_eq!(result.confidence, 0);
    }

    #[test]
    fn test_brand_override() {
        let brands = vec!["nordvpn".to_string()];
        let isp = ProviderVerdict {
            provider: Some("NordVPN S.A.".into()),
            confidence: 10,
            ..ProviderVerdict::default()
        };
        let result = fuse(&[("a", isp)], &brands);
        assert!(result.is_vpn);
        assert_eq!(result.confidence, 95);
        assert_eq!(result.provider.as_deref(), Some("NordVPN S.A."));
    }

    #[tokio::test]
    async fn test_failed_and_slow_providers_are_excluded() {
        let resolver = VpnResolver::new(
            &config(),
            vec![
                FakeVpn::arc("ok", Script::Verdict(verdict(true, 80))),
                FakeVpn::arc("broken", Script::Fail),
                FakeVpn::arc("slow", Script::Hang),
            ],
        );
        let result = resolver.resolve(&public_ip()).await;
        assert!(result.is_vpn);
        assert_eq!(result.confidence, 80);
        assert_eq!(result.source, "ok");
    }

    #[tokio::test]
    async fn test_no_responses_is_neutral() {
        let resolver = VpnResolver::new(&config(), vec![FakeVpn::arc("broken", Script::Fail)]);
        assert_eq!(resolver.resolve(&public_ip()).await, VpnResult::neutral());

        let resolver = VpnResolver::new(&config(), Vec::new());
        assert_eq!(resolver.resolve(&public_ip()).await, VpnResult::neutral());
    }

    #[tokio::test]
    async fn test_should_block_threshold() {
        let resolver = VpnResolver::new(
            &config(),
            vec![FakeVpn::arc("a", Script::Verdict(verdict(true, 60)))],
        );
        assert!(resolver.should_block(&public_ip(), 50).await.block);
        assert!(!resolver.should_block(&public_ip(), 61).await.block);
    }

    #[tokio::test]
    async fn test_datacenter_alone_never_blocks() {
        let resolver = VpnResolver::new(
            &config(),
            vec![FakeVpn::arc(
                "a",
                Script::Verdict(ProviderVerdict {
                    is_datacenter: true,
                    confidence: 100,
                    ..ProviderVerdict::default()
                }),
            )],
        );
        let decision = resolver.should_block(&public_ip(), 50).await;
        assert!(!decision.block);
        assert!(decision.result.is_datacenter);
    }

    #[tokio::test]
    async fn test_private_identity_skips_providers() {
        let provider = Arc::new(FakeVpn {
            name: "a",
            script: Script::Verdict(verdict(true, 100)),
            calls: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn VpnProvider> = provider.clone();
        let resolver = VpnResolver::new(&config(), vec![as_dyn]);

        let result = resolver.resolve(&ClientIdentity::new("192.168.1.10")).await;
        assert!(!result.is_vpn);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_from_config_only_keyed_providers() {
        let client = reqwest::Client::new();
        assert_eq!(VpnResolver::from_config(&VpnConfig::default(), &client).provider_count(), 0);

        let config = VpnConfig {
            proxycheck_api_key: Some("k".into()),
            iphub_api_key: Some("k".into()),
            ..VpnConfig::default()
        };
        assert_eq!(VpnResolver::from_config(&config, &client).provider_count(), 2);
    }
}
