//! Transport-independent view of an inbound request.

use std::collections::HashMap;
use std::net::IpAddr;

/// The request attributes consumed by the admission pipeline.
///
/// Header names are stored lower-cased; lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// HTTP method, upper-case.
    pub method: String,
    /// URL path without query string.
    pub path: String,
    /// Request headers keyed by lower-case name.
    headers: HashMap<String, String>,
    /// Transport-layer peer address.
    pub peer_addr: Option<IpAddr>,
}

impl RequestInfo {
    /// Create a request with no headers.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            headers: HashMap::new(),
            peer_addr: None,
        }
    }

    /// Add a header. Repeated names are joined with `", "`.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    /// Set the transport peer address.
    #[must_use]
    pub const fn with_peer(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Add a header in place.
    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    /// Look up a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The `User-Agent` header.
    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Parsed `Cookie` header as `(name, value)` pairs.
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.header("cookie")
            .into_iter()
            .flat_map(|raw| raw.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then_some((name, value.trim()))
            })
    }

    /// Check whether a non-empty cookie with this name is present.
    #[must_use]
    pub fn has_cookie(&self, name: &str) -> bool {
        self.cookies().any(|(n, v)| n == name && !v.is_empty())
    }

    /// First non-empty country code supplied by the hosting platform.
    #[must_use]
    pub fn platform_country(&self, header_names: &[String]) -> Option<String> {
        header_names.iter().find_map(|name| {
            let value = self.header(name)?.trim();
            // CDNs use "XX"/"T1" for unknown and Tor.
            let usable = value.len() == 2 && value != "XX" && value != "T1";
            usable.then(|| value.to_ascii_uppercase())
        })
    }
}
