//! HTTP geo-IP providers.

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use super::{GeoLookup, GeoProvider};
use crate::error::{GuardError, GuardFuture, GuardResult};

/// ip-api.com JSON endpoint.
const IP_API_URL: &str = "http://ip-api.com/json";
/// ipapi.co JSON endpoint.
const IPAPI_CO_URL: &str = "https://ipapi.co";

/// Response body of ip-api.com.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    continent_code: Option<String>,
}

impl IpApiResponse {
    fn into_lookup(self) -> GuardResult<Option<GeoLookup>> {
        if self.status != "success" {
            return match self.message.as_deref() {
                // Reserved and private ranges are "fail" without being an outage.
                Some("private range" | "reserved range") => Ok(None),
                other => Err(GuardError::provider(
                    "ip-api",
                    other.unwrap_or("lookup failed"),
                )),
            };
        }
        Ok(non_empty(self.country_code).map(|country_code| GeoLookup {
            country_code: country_code.to_ascii_uppercase(),
            continent: non_empty(self.continent_code),
        }))
    }
}

/// Response body of ipapi.co.
#[derive(Debug, Deserialize)]
struct IpapiCoResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    reserved: bool,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    continent_code: Option<String>,
}

impl IpapiCoResponse {
    fn into_lookup(self) -> GuardResult<Option<GeoLookup>> {
        if self.reserved {
            return Ok(None);
        }
        if self.error {
            return Err(GuardError::provider(
                "ipapi.co",
                self.reason.as_deref().unwrap_or("lookup failed"),
            ));
        }
        Ok(non_empty(self.country_code).map(|country_code| GeoLookup {
            country_code: country_code.to_ascii_uppercase(),
            continent: non_empty(self.continent_code),
        }))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    provider: &'static str,
    url: String,
    timeout: Duration,
) -> GuardResult<T> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| GuardError::provider(provider, e))?;
    if !response.status().is_success() {
        return Err(GuardError::provider(
            provider,
            format!("HTTP {}", response.status()),
        ));
    }
    response
        .json()
        .await
        .map_err(|e| GuardError::provider(provider, e))
}

/// Provider A: ip-api.com.
#[derive(Debug, Clone)]
pub struct IpApiProvider {
    client: reqwest::Client,
    timeout: Duration,
}

impl IpApiProvider {
    /// Create the provider.
    #[must_use]
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl GeoProvider for IpApiProvider {
    fn name(&self) -> &'static str {
        "ip-api"
    }

    fn lookup(&self, ip: IpAddr) -> GuardFuture<'_, Option<GeoLookup>> {
        Box::pin(async move {
            let url = format!("{IP_API_URL}/{ip}?fields=status,message,countryCode,continentCode");
            let body: IpApiResponse = fetch_json(&self.client, self.name(), url, self.timeout).await?;
            body.into_lookup()
        })
    }
}

/// Provider B: ipapi.co.
#[derive(Debug, Clone)]
pub struct IpapiCoProvider {
    client: reqwest::Client,
    timeout: Duration,
}

impl IpapiCoProvider {
    /// Create the provider.
    #[must_use]
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl GeoProvider for IpapiCoProvider {
    fn name(&self) -> &'static str {
        "ipapi.co"
    }

    fn lookup(&self, ip: IpAddr) -> GuardFuture<'_, Option<GeoLookup>> {
        Box::pin(async move {
            let url = format!("{IPAPI_CO_URL}/{ip}/json/");
            let body: IpapiCoResponse =
                fetch_json(&self.client, self.name(), url, self.timeout).await?;
            body.into_lookup()
        })
    }
}
