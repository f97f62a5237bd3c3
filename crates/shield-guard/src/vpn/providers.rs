//! HTTP VPN/proxy detection providers.
//!
//! Each provider maps its native response onto [`ProviderVerdict`]:
//!
//! | Provider | Confidence source |
//! |----------|-------------------|
//! | proxycheck.io | `risk`, or 90/0 from the `proxy` flag |
//! | ipqualityscore.com | `fraud_score` |
//! | iphub.info | `block`: 1 → 90, 2 → 50, 0 → 0 |

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use super::{ProviderVerdict, VpnProvider};
use crate::error::{GuardError, GuardFuture, GuardResult};

const PROXYCHECK_URL: &str = "https://proxycheck.io/v2";
const IPQS_URL: &str = "https://ipqualityscore.com/api/json/ip";
const IPHUB_URL: &str = "https://v2.api.iphub.info/ip";

async fn send(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> GuardResult<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| GuardError::provider(provider, e))?;
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(GuardError::provider(provider, format!("HTTP {}", response.status())))
    }
}

#[derive(Debug, Deserialize)]
struct ProxyCheckAddress {
    #[serde(default)]
    proxy: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    risk: Option<u32>,
}

/// proxycheck.io v2.
#[derive(Debug, Clone)]
pub struct ProxyCheckProvider {
    client: reqwest::Client,
    api_key: String,
    timeout: Duration,
}

impl ProxyCheckProvider {
    /// Create the provider.
    #[must_use]
    pub fn new(client: reqwest::Client, api_key: String, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            timeout,
        }
    }

    fn parse(ip: IpAddr, body: &serde_json::Value) -> GuardResult<ProviderVerdict> {
        let status = body.get("status").and_then(serde_json::Value::as_str);
        if !matches!(status, Some("ok" | "warning")) {
            let message = body
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unexpected status");
            return Err(GuardError::provider("proxycheck", message));
        }

        // The verdict is keyed by the queried address.
        let entry = body
            .get(ip.to_string())
            .cloned()
            .ok_or_else(|| GuardError::provider("proxycheck", "address missing from response"))?;
        let entry: ProxyCheckAddress =
            serde_json::from_value(entry).map_err(|e| GuardError::provider("proxycheck", e))?;

        let is_proxy = entry.proxy.as_deref() == Some("yes");
        let kind = entry.kind.as_deref().unwrap_or_default().to_ascii_lowercase();
        let confidence = entry
            .risk
            .map_or(if is_proxy { 90 } else { 0 }, |risk| risk.min(100) as u8);

        Ok(ProviderVerdict {
            is_vpn: kind == "vpn",
            is_proxy,
            is_datacenter: kind == "hosting",
            is_tor: kind == "tor",
            provider: entry.provider,
            confidence,
        })
    }
}

impl VpnProvider for ProxyCheckProvider {
    fn name(&self) -> &'static str {
        "proxycheck"
    }

    fn lookup(&self, ip: IpAddr) -> GuardFuture<'_, ProviderVerdict> {
        Box::pin(async move {
            let request = self
                .client
                .get(format!("{PROXYCHECK_URL}/{ip}"))
                .query(&[("key", self.api_key.as_str()), ("vpn", "1"), ("asn", "1"), ("risk", "1")])
                .timeout(self.timeout);
            let body: serde_json::Value = send(self.name(), request)
                .await?
                .json()
                .await
                .map_err(|e| GuardError::provider(self.name(), e))?;
            Self::parse(ip, &body)
        })
    }
}

#[derive(Debug, Deserialize)]
struct IpqsResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    proxy: bool,
    #[serde(default)]
    vpn: bool,
    #[serde(default)]
    active_vpn: bool,
    #[serde(default)]
    tor: bool,
    #[serde(default)]
    active_tor: bool,
    #[serde(default)]
    fraud_score: u32,
    #[serde(default, rename = "ISP")]
    isp: Option<String>,
    #[serde(default)]
    connection_type: Option<String>,
}

impl IpqsResponse {
    fn into_verdict(self) -> GuardResult<ProviderVerdict> {
        if !self.success {
            return Err(GuardError::provider(
                "ipqualityscore",
                self.message.as_deref().unwrap_or("request failed"),
            ));
        }
        Ok(ProviderVerdict {
            is_vpn: self.vpn || self.active_vpn,
            is_proxy: self.proxy,
            is_datacenter: self
                .connection_type
                .is_some_and(|t| t.eq_ignore_ascii_case("data center")),
            is_tor: self.tor || self.active_tor,
            provider: self.isp,
            confidence: self.fraud_score.min(100) as u8,
        })
    }
}

/// ipqualityscore.com proxy/VPN API.
#[derive(Debug, Clone)]
pub struct IpQualityScoreProvider {
    client: reqwest::Client,
    api_key: String,
    timeout: Duration,
}

impl IpQualityScoreProvider {
    /// Create the provider.
    #[must_use]
    pub fn new(client: reqwest::Client, api_key: String, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            timeout,
        }
    }
}

impl VpnProvider for IpQualityScoreProvider {
    fn name(&self) -> &'static str {
        "ipqualityscore"
    }

    fn lookup(&self, ip: IpAddr) -> GuardFuture<'_, ProviderVerdict> {
        Box::pin(async move {
            let request = self
                .client
                .get(format!("{IPQS_URL}/{}/{ip}", self.api_key))
                .query(&[("strictness", "1")])
                .timeout(self.timeout);
            let body: IpqsResponse = send(self.name(), request)
                .await?
                .json()
                .await
                .map_err(|e| GuardError::provider(self.name(), e))?;
            body.into_verdict()
        })
    }
}

#[derive(Debug, Deserialize)]
struct IpHubResponse {
    block: u8,
    #[serde(default)]
    isp: Option<String>,
}

impl IpHubResponse {
    fn into_verdict(self) -> ProviderVerdict {
        let (is_proxy, confidence) = match self.block {
            1 => (true, 90),
            2 => (false, 50),
            _ => (false, 0),
        };
        ProviderVerdict {
            is_vpn: false,
            is_proxy,
            is_datacenter: self.block == 1,
            is_tor: false,
            provider: self.isp.filter(|isp| !isp.is_empty()),
            confidence,
        }
    }
}

/// iphub.info v2.
#[derive(Debug, Clone)]
pub struct IpHubProvider {
    client: reqwest::Client,
    api_key: String,
    timeout: Duration,
}

impl IpHubProvider {
    /// Create the provider.
    #[must_use]
    pub fn new(client: reqwest::Client, api_key: String, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            timeout,
        }
    }
}

impl VpnProvider for IpHubProvider {
    fn name(&self) -> &'static str {
        "iphub"
    }

    fn lookup(&self, ip: IpAddr) -> GuardFuture<'_, ProviderVerdict> {
        Box::pin(async move {
            let request = self
                .client
                .get(format!("{IPHUB_URL}/{ip}"))
                .header("X-Key", self.api_key.as_str())
                .timeout(self.timeout);
            let body: IpHubResponse = send(self.name(), request)
                .await?
                .json()
                .await
                .map_err(|e| GuardError::provider(self.name(), e))?;
            Ok(body.into_verdict())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn ip() -> IpAddr {
        "198.51.100.20".parse().unwrap()
    }

    #[test]
    fn test_proxycheck_vpn_with_risk() {
        let body = serde_json::json!({
            "status": "ok",
            "198.51.100.20": {"proxy": "yes", "type": "VPN", "provider": "M247 Ltd", "risk": 66}
        });
        let verdict = ProxyCheckProvider::parse(ip(), &body).unwrap();
        assert!(verdict.is_vpn);
        assert!(verdict.is_proxy);
        assert_eq!(verdict.confidence, 66);
        assert_eq!(verdict.provider.as_deref(), Some("M247 Ltd"));
    }

    #[test]
    fn test_proxycheck_without_risk_uses_flag() {
        let body = serde_json::json!({
            "status": "ok",
            "198.51.100.20": {"proxy": "yes", "type": "TOR"}
        });
        let verdict = ProxyCheckProvider::parse(ip(), &body).unwrap();
        assert!(verdict.is_tor);
        assert_eq!(verdict.confidence, 90);

        let body = serde_json::json!({
            "status": "ok",
            "198.51.100.20": {"proxy": "no", "type": "Hosting"}
        });
        let verdict = ProxyCheckProvider::parse(ip(), &body).unwrap();
        assert!(verdict.is_datacenter);
        assert!(!verdict.is_proxy);
        assert_eq!(verdict.confidence, 0);
    }

    #[test]
    fn test_proxycheck_denied_status() {
        let body = serde_json::json!({"status": "denied", "message": "Invalid API key"});
        let err = ProxyCheckProvider::parse(ip(), &body).unwrap_err();
        assert!(err.to_string().contains("Invalid API key"));
    }

    #[test]
    fn test_ipqs_mapping() {
        let body: IpqsResponse = serde_json::from_str(
            r#"{"success":true,"proxy":true,"vpn":false,"active_vpn":true,"tor":false,
                "fraud_score":88,"ISP":"Datacamp Limited","connection_type":"Data Center"}"#,
        )
        .unwrap();
        let verdict = body.into_verdict().unwrap();
        assert!(verdict.is_vpn);
        assert!(verdict.is_proxy);
        assert!(verdict.is_datacenter);
        assert_eq!(verdict.confidence, 88);
    }

    #[test]
    fn test_ipqs_failure() {
        let body: IpqsResponse =
            serde_json::from_str(r#"{"success":false,"message":"Insufficient credits"}"#).unwrap();
        assert!(body.into_verdict().is_err());
    }

    #[test_case(0, false, 0 ; "residential")]
    #[test_case(1, true, 90 ; "non residential")]
    #[test_case(2, false, 50 ; "mixed")]
    fn test_iphub_block_levels(block: u8, is_proxy: bool, confidence: u8) {
        let body: IpHubResponse = serde_json::from_value(serde_json::json!({
            "ip": "198.51.100.20",
            "block": block,
            "isp": "Example ISP"
        }))
        .unwrap();
        let verdict = body.into_verdict();
        assert_eq!(verdict.is_proxy, is_proxy);
        assert_eq!(verdict.confidence, confidence);
        assert_eq!(verdict.provider.as_deref(), Some("Example ISP"));
    }
}
