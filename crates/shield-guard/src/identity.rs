//! Client identity resolution.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::request::RequestInfo;

/// Headers consulted for the originating address, highest priority first.
pub const IDENTITY_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Sentinel used when no address can be determined.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Best-effort network identity of a request's origin.
///
/// Shared NATs and spoofable proxy headers mean this is not unique per
/// physical client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Wrap an already-resolved identity.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The sentinel identity.
    #[must_use]
    pub fn unknown() -> Self {
        Self(UNKNOWN_IDENTITY.to_string())
    }

    /// Resolve from proxy headers, then the peer address, then the sentinel.
    #[must_use]
    pub fn from_request(request: &RequestInfo) -> Self {
        for name in IDENTITY_HEADERS {
            let Some(raw) = request.header(name) else {
                continue;
            };
            // X-Forwarded-For is "client, proxy1, proxy2".
            let first_hop = raw.split(',').next().unwrap_or_default().trim();
            if !first_hop.is_empty() {
                return Self(normalize(first_hop));
            }
        }

        request
            .peer_addr
            .map_or_else(Self::unknown, |addr| Self(addr.to_string()))
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the identity as an IP address.
    #[must_use]
    pub fn as_ip(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }

    /// Whether this is the sentinel.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_IDENTITY
    }

    /// Whether external lookups make sense for this identity.
    ///
    /// Private, loopback, link-local and unparsable identities are never sent
    /// to third-party providers.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        match self.as_ip() {
            Some(IpAddr::V4(v4)) => {
                !(v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
                    || v4.is_documentation())
            }
            Some(IpAddr::V6(v6)) => {
                let first = v6.segments()[0];
                !(v6.is_loopback()
                    || v6.is_unspecified()
                    || (first & 0xfe00) == 0xfc00
                    || (first & 0xffc0) == 0xfe80)
            }
            None => false,
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(addr: IpAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Strip a port or IPv6 brackets some proxies leave on the address.
fn normalize(raw: &str) -> String {
    if let Ok(addr) = raw.parse::<IpAddr>() {
        return addr.to_string();
    }
    if let Ok(sock) = raw.parse::<std::net::SocketAddr>() {
        return sock.ip().to_string();
    }
    raw.trim_matches(|c| c == '[' || c == ']').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_forwarded_for_first_hop_wins() {
        let req = RequestInfo::new("GET", "/")
            .with_header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .with_header("X-Real-IP", "198.51.100.1")
            .with_peer("10.0.0.9".parse().unwrap());
        assert_eq!(ClientIdentity::from_request(&req).as_str(), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_before_cdn_header() {
        let req = RequestInfo::new("GET", "/")
            .with_header("CF-Connecting-IP", "198.51.100.2")
            .with_header("X-Real-IP", "198.51.100.1");
        assert_eq!(ClientIdentity::from_request(&req).as_str(), "198.51.100.1");
    }

    #[test]
    fn test_cdn_header_used_when_alone() {
        let req = RequestInfo::new("GET", "/").with_header("CF-Connecting-IP", "198.51.100.2");
        assert_eq!(ClientIdentity::from_request(&req).as_str(), "198.51.100.2");
    }

    #[test]
    fn test_falls_back_to_peer_then_unknown() {
        let req = RequestInfo::new("GET", "/").with_peer("192.0.2.4".parse().unwrap());
        assert_eq!(ClientIdentity::from_request(&req).as_str(), "192.0.2.4");

        let req = RequestInfo::new("GET", "/").with_header("X-Forwarded-For", " ");
        let identity = ClientIdentity::from_request(&req);
        assert!(identity.is_unknown());
        assert!(!identity.is_routable());
    }

    #[test_case("203.0.113.7:443", "203.0.113.7" ; "v4 with port")]
    #[test_case("[2001:db8::1]:8443", "2001:db8::1" ; "v6 with port")]
    #[test_case("[2001:db8::1]", "2001:db8::1" ; "bracketed v6")]
    #[test_case("not-an-ip", "not-an-ip" ; "opaque value kept")]
    fn test_normalize(raw: &str, expected: &str) {
        assert_eq!(normalize(raw), expected);
    }

    #[test_case("8.8.8.8", true ; "public v4")]
    #[test_case("10.1.2.3", false ; "private v4")]
    #[test_case("127.0.0.1", false ; "loopback v4")]
    #[test_case("2606:4700::1111", true ; "public v6")]
    #[test_case("fd00::1", false ; "unique local v6")]
    #[test_case("fe80::1", false ; "link local v6")]
    #[test_case("unknown", false ; "sentinel")]
    fn test_is_routable(raw: &str, expected: bool) {
        assert_eq!(ClientIdentity::new(raw).is_routable(), expected);
    }
}
