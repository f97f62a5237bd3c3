//! Geographic resolution.
//!
//! The resolver trusts a country code supplied by the hosting platform when
//! one is present. Otherwise it asks two external geo-IP services in order
//! and, when neither answers, returns a fallback result whose
//! `is_european` is taken from configuration (permissive by default).

mod providers;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GeoConfig;
use crate::error::GuardFuture;
use crate::identity::ClientIdentity;

pub use providers::{IpApiProvider, IpapiCoProvider};

/// Country codes treated as European: EU-27, the EEA members IS/LI/NO,
/// Switzerland and the United Kingdom.
pub const EUROPEAN_COUNTRIES: [&str; 32] = [
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE", "IS", "LI", "NO",
    "CH", "GB",
];

/// Where a [`GeoResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeoSource {
    /// Header set by the hosting platform.
    Platform,
    /// First external provider.
    ExternalA,
    /// Second external provider.
    ExternalB,
    /// No provider answered.
    Fallback,
}

/// Resolved location of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoResult {
    /// ISO 3166-1 alpha-2 code, if known.
    pub country_code: Option<String>,
    /// Two-letter continent code, if known.
    pub continent: Option<String>,
    /// Whether the client counts as European.
    pub is_european: bool,
    /// Resolution path.
    pub source: GeoSource,
}

/// A single provider's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoLookup {
    /// Country code, upper-case.
    pub country_code: String,
    /// Continent code, if reported.
    pub continent: Option<String>,
}

/// External geo-IP service.
pub trait GeoProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Look up an address. `Ok(None)` means the provider had no data.
    fn lookup(&self, ip: IpAddr) -> GuardFuture<'_, Option<GeoLookup>>;
}

/// Resolves client identities to a [`GeoResult`].
pub struct GeoResolver {
    provider_a: Option<Arc<dyn GeoProvider>>,
    provider_b: Option<Arc<dyn GeoProvider>>,
    european: HashSet<String>,
    fallback_allows: bool,
    provider_timeout: Duration,
}

impl std::fmt::Debug for GeoResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoResolver")
            .field("provider_a", &self.provider_a.as_ref().map(|p| p.name()))
            .field("provider_b", &self.provider_b.as_ref().map(|p| p.name()))
            .field("fallback_allows", &self.fallback_allows)
            .finish_non_exhaustive()
    }
}

impl GeoResolver {
    /// Create a resolver with explicit providers.
    #[must_use]
    pub fn new(
        config: &GeoConfig,
        provider_a: Option<Arc<dyn GeoProvider>>,
        provider_b: Option<Arc<dyn GeoProvider>>,
    ) -> Self {
        Self {
            provider_a,
            provider_b,
            european: config
                .european_countries
                .iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
            fallback_allows: config.fallback_allows,
            provider_timeout: config.provider_timeout,
        }
    }

    /// Create a resolver using the ip-api.com and ipapi.co services.
    #[must_use]
    pub fn with_default_providers(config: &GeoConfig, client: reqwest::Client) -> Self {
        Self::new(
            config,
            Some(Arc::new(IpApiProvider::new(client.clone(), config.provider_timeout))),
            Some(Arc::new(IpapiCoProvider::new(client, config.provider_timeout))),
        )
    }

    /// Check a country code against the European list.
    #[must_use]
    pub fn is_european(&self, country_code: &str) -> bool {
        self.european.contains(&country_code.to_ascii_uppercase())
    }

    fn known(&self, country_code: &str, continent: Option<String>, source: GeoSource) -> GeoResult {
        let country_code = country_code.trim().to_ascii_uppercase();
        GeoResult {
            is_european: self.is_european(&country_code),
            country_code: Some(country_code),
            continent,
            source,
        }
    }

    fn fallback(&self) -> GeoResult {
        GeoResult {
            country_code: None,
            continent: None,
            is_european: self.fallback_allows,
            source: GeoSource::Fallback,
        }
    }

    /// Resolve a client's location.
    ///
    /// A non-empty `platform_hint` wins without any network call.
    pub async fn resolve(&self, identity: &ClientIdentity, platform_hint: Option<&str>) -> GeoResult {
        if let Some(hint) = platform_hint.map(str::trim).filter(|h| !h.is_empty()) {
            return self.known(hint, None, GeoSource::Platform);
        }

        let Some(ip) = identity.as_ip().filter(|_| identity.is_routable()) else {
            debug!(ip = %identity, "non-routable identity, using geo fallback");
            return self.fallback();
        };

        let mut failed = Vec::new();
        for (provider, source) in [
            (&self.provider_a, GeoSource::ExternalA),
            (&self.provider_b, GeoSource::ExternalB),
        ] {
            let Some(provider) = provider else {
                continue;
            };
            match tokio::time::timeout(self.provider_timeout, provider.lookup(ip)).await {
                Ok(Ok(Some(found))) => return self.known(&found.country_code, found.continent, source),
                Ok(Ok(None)) => {
                    debug!(ip = %identity, provider = provider.name(), "geo provider had no data");
                    failed.push(provider.name());
                }
                Ok(Err(err)) => {
                    debug!(ip = %identity, provider = provider.name(), error = %err, "geo provider failed");
                    failed.push(provider.name());
                }
                Err(_) => {
                    debug!(ip = %identity, provider = provider.name(), "geo provider timed out");
                    failed.push(provider.name());
                }
            }
        }

        warn!(
            ip = %identity,
            failed = ?failed,
            is_european = self.fallback_allows,
            "geo resolution inconclusive, using fallback"
        );
        self.fallback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Script {
        Answer(&'static str),
        NoData,
        Fail,
        Hang,
    }

    struct FakeGeo {
        name: &'static str,
        script: Script,
        calls: AtomicUsize,
    }

    impl FakeGeo {
        fn new(name: &'static str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                name,
                script,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl GeoProvider for FakeGeo {
        fn name(&self) -> &'static str {
            self.name
        }

        fn lookup(&self, _ip: IpAddr) -> GuardFuture<'_, Option<GeoLookup>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match self.script {
                    Script::Answer(code) => Ok(Some(GeoLookup {
                        country_code: code.to_string(),
                        continent: Some("EU".into()),
                    })),
                    Script::NoData => Ok(None),
                    Script::Fail => Err(GuardError::provider(self.name, "HTTP 503")),
                    Script::Hang => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(None)
                    }
                }
            })
        }
    }

    fn config() -> GeoConfig {
        GeoConfig {
            provider_timeout: Duration::from_millis(50),
            ..GeoConfig::default()
        }
    }

    fn resolver(a: &Arc<FakeGeo>, b: &Arc<FakeGeo>) -> GeoResolver {
        let a: Arc<dyn GeoProvider> = a.clone();
        let b: Arc<dyn GeoProvider> = b.clone();
        GeoResolver::new(&config(), Some(a), Some(b))
    }

    fn public_ip() -> ClientIdentity {
        ClientIdentity::new("8.8.8.8")
    }

    #[tokio::test]
    async fn test_platform_hint_skips_providers() {
        let a = FakeGeo::new("a", Script::Answer("DE"));
        let b = FakeGeo::new("b", Script::Answer("DE"));
        let geo = resolver(&a, &b);

        let result = geo.resolve(&public_ip(), Some("US")).await;
        assert_eq!(result.source, GeoSource::Platform);
        assert_eq!(result.country_code.as_deref(), Some("US"));
        assert!(!result.is_european);
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_a_wins() {
        let a = FakeGeo::new("a", Script::Answer("fr"));
        let b = FakeGeo::new("b", Script::Answer("US"));
        let result = resolver(&a, &b).resolve(&public_ip(), None).await;

        assert_eq!(result.source, GeoSource::ExternalA);
        assert_eq!(result.country_code.as_deref(), Some("FR"));
        assert!(result.is_european);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_b_after_a_fails() {
        let a = FakeGeo::new("a", Script::Fail);
        let b = FakeGeo::new("b", Script::Answer("US"));
        let result = resolver(&a, &b).resolve(&public_ip(), None).await;

        assert_eq!(result.source, GeoSource::ExternalB);
        assert!(!result.is_european);
    }

    #[tokio::test]
    async fn test_timeout_then_fallback() {
        let a = FakeGeo::new("a", Script::Hang);
        let b = FakeGeo::new("b", Script::NoData);
        let result = resolver(&a, &b).resolve(&public_ip(), Some("  ")).await;

        assert_eq!(result.source, GeoSource::Fallback);
        assert!(result.country_code.is_none());
        assert!(result.is_european);
    }

    #[tokio::test]
    async fn test_fallback_respects_config() {
        let geo = GeoResolver::new(
            &GeoConfig {
                fallback_allows: false,
                ..config()
            },
            None,
            None,
        );
        let result = geo.resolve(&public_ip(), None).await;
        assert_eq!(result.source, GeoSource::Fallback);
        assert!(!result.is_european);
    }

    #[tokio::test]
    async fn test_private_identity_never_queries_providers() {
        let a = FakeGeo::new("a", Script::Answer("US"));
        let b = FakeGeo::new("b", Script::Answer("US"));
        let geo = resolver(&a, &b);

        let result = geo.resolve(&ClientIdentity::new("10.0.0.1"), None).await;
        assert_eq!(result.source, GeoSource::Fallback);
        let result = geo.resolve(&ClientIdentity::unknown(), None).await;
        assert_eq!(result.source, GeoSource::Fallback);
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_european_list() {
        let geo = GeoResolver::new(&GeoConfig::default(), None, None);
        for code in ["DE", "fr", "NO", "CH", "GB", "IS"] {
            assert!(geo.is_european(code), "{code}");
        }
        for code in ["US", "RU", "CN", "TR", "BR"] {
            assert!(!geo.is_european(code), "{code}");
        }
    }

    #[test]
    fn test_source_serialization() {
        assert_eq!(serde_json::to_value(GeoSource::ExternalA).unwrap(), "external-a");
        assert_eq!(serde_json::to_value(GeoSource::Platform).unwrap(), "platform");
    }
}
