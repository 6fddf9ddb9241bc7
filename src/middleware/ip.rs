//! Client identity resolution.
//!
//! Every stage of the admission pipeline keys its decisions on the
//! [`ClientIdentity`] resolved here, once per request.
//!
//! # Resolution Order
//!
//! The first candidate that parses as an IPv4/IPv6 literal wins:
//!
//! ```text
//!   cf-connecting-ip / true-client-ip / fastly-client-ip   (CdnHeader)
//!                │ absent or invalid
//!                ▼
//!            x-real-ip                                      (ProxyHeader)
//!                │
//!                ▼
//!   first entry of x-forwarded-for                          (ProxyHeader)
//!                │
//!                ▼
//!   socket peer (ConnectInfo<SocketAddr>)                   (Direct)
//!                │
//!                ▼
//!            "unknown"                                      (Unresolved)
//! ```
//!
//! IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are canonicalized to IPv4 so
//! that quota keys and allow-lists see one spelling per client.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! Forwarding headers are client-controlled. Without `TRUSTED_PROXIES`, any
//! client can pick its own identity by sending `X-Forwarded-For`. Configure
//! the CIDR ranges of your load balancers so that headers are only honoured
//! when the socket peer is one of them:
//!
//! ```bash
//! TRUSTED_PROXIES=10.0.0.0/8,172.16.0.0/12
//! ```
//!
//! ## The "unknown" Fallback
//!
//! Requests with no resolvable address share the `"unknown"` key, so they are
//! rate-limited collectively. Monitor for high "unknown" traffic in production.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use ipnet::IpNet;
use serde::Serialize;
use tracing::{debug, warn};

/// Sentinel IP value when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// CDN headers carrying the original client address, checked in order.
pub const CDN_IP_HEADERS: [&str; 3] = ["cf-connecting-ip", "true-client-ip", "fastly-client-ip"];

/// Headers hashed into the device fingerprint (the resolved IP is appended).
const FINGERPRINT_HEADERS: [&str; 7] = [
    "user-agent",
    "accept-language",
    "accept-encoding",
    "accept",
    "sec-ch-ua",
    "sec-ch-ua-platform",
    "sec-ch-ua-mobile",
];

/// Hex characters kept from the BLAKE3 digest.
const FINGERPRINT_LEN: usize = 32;

/// Where the resolved IP came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSource {
    Direct,
    ProxyHeader,
    CdnHeader,
    Unresolved,
}

/// Request-scoped client identity, stored as a request extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientIdentity {
    /// Canonical IP literal, or [`UNKNOWN_IP`].
    pub ip: String,
    pub ip_source: IpSource,
    pub device_fingerprint: String,
    /// Whether the socket peer lies inside a configured trusted proxy range.
    pub is_trusted_proxy: bool,
}

impl ClientIdentity {
    /// Parsed form of [`Self::ip`], `None` for the sentinel.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.parse().ok()
    }

    pub fn is_unresolved(&self) -> bool {
        self.ip_source == IpSource::Unresolved
    }
}

// =============================================================================
// Trusted Proxy Ranges
// =============================================================================

/// Configuration for trusted proxy validation.
///
/// When configured, forwarding headers are only honoured for requests whose
/// socket peer lies inside one of these networks.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<IpNet>,
}

impl TrustedProxyConfig {
    /// Parse CIDR strings. A bare address is treated as a host route.
    ///
    /// Invalid entries are logged as warnings and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<IpNet> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = parse_network(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    /// Check if trusted proxy validation is enabled (any ranges configured).
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Check if an address lies inside any configured range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.ranges.iter().any(|range| range.contains(&ip))
    }
}

/// Parse `a.b.c.d/nn`, `::1/128`, or a bare address.
pub fn parse_network(raw: &str) -> Option<IpNet> {
    let raw = raw.trim();
    raw.parse::<IpNet>()
        .ok()
        .or_else(|| raw.parse::<IpAddr>().ok().map(IpNet::from))
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves [`ClientIdentity`] from request headers and the socket peer.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    trusted_proxies: TrustedProxyConfig,
}

impl IdentityResolver {
    pub fn new(trusted_proxies: TrustedProxyConfig) -> Self {
        Self { trusted_proxies }
    }

    /// Resolve identity for an axum request, reading `ConnectInfo` if present.
    pub fn resolve_request<B>(&self, req: &Request<B>) -> ClientIdentity {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        self.resolve(req.headers(), peer)
    }

    /// Resolve identity from headers and an optional socket peer.
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientIdentity {
        let peer_ip = peer.map(|addr| addr.ip().to_canonical());
        let is_trusted_proxy =
            self.trusted_proxies.is_enabled() && peer_ip.is_some_and(|ip| self.trusted_proxies.contains(&ip));

        // An untrusted peer cannot vouch for forwarding headers
        let honour_headers =
            !self.trusted_proxies.is_enabled() || peer_ip.is_none() || is_trusted_proxy;

        let from_headers = if honour_headers {
            ip_from_headers(headers)
        } else {
            if has_forwarding_headers(headers) {
                debug!(
                    peer = ?peer_ip,
                    "Ignoring forwarding headers from untrusted peer"
                );
            }
            None
        };

        let (ip, ip_source) = match from_headers.or(peer_ip.map(|ip| (ip, IpSource::Direct))) {
            Some((ip, source)) => (ip.to_string(), source),
            None => (UNKNOWN_IP.to_string(), IpSource::Unresolved),
        };

        let device_fingerprint = device_fingerprint(headers, &ip);

        ClientIdentity {
            ip,
            ip_source,
            device_fingerprint,
            is_trusted_proxy,
        }
    }
}

/// Walk the header candidates in priority order.
fn ip_from_headers(headers: &HeaderMap) -> Option<(IpAddr, IpSource)> {
    for name in CDN_IP_HEADERS {
        if let Some(ip) = header_str(headers, name).and_then(parse_ip) {
            return Some((ip, IpSource::CdnHeader));
        }
    }

    if let Some(ip) = header_str(headers, "x-real-ip").and_then(parse_ip) {
        return Some((ip, IpSource::ProxyHeader));
    }

    // Format: "client, proxy1, proxy2" - only the first entry names the client
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .and_then(parse_ip)
        .map(|ip| (ip, IpSource::ProxyHeader))
}

fn has_forwarding_headers(headers: &HeaderMap) -> bool {
    CDN_IP_HEADERS
        .iter()
        .chain(["x-real-ip", "x-forwarded-for"].iter())
        .any(|name| headers.contains_key(*name))
}

#[inline]
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Strictly parse an IP literal; ports and hostnames are rejected.
#[inline]
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
}

/// Deterministic, one-way device fingerprint.
///
/// BLAKE3 over the fingerprint headers and the resolved IP, truncated to 32
/// hex characters. Missing headers hash as empty fields.
pub fn device_fingerprint(headers: &HeaderMap, ip: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for name in FINGERPRINT_HEADERS {
        hasher.update(header_str(headers, name).unwrap_or_default().as_bytes());
        hasher.update(b"|");
    }
    hasher.update(ip.as_bytes());

    hasher
        .finalize()
        .to_hex()
        .chars()
        .take(FINGERPRINT_LEN)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn test_cdn_header_wins() {
        let resolver = IdentityResolver::default();
        let id = resolver.resolve(
            &headers(&[
                ("cf-connecting-ip", "203.0.113.7"),
                ("x-real-ip", "198.51.100.1"),
                ("x-forwarded-for", "192.0.2.1"),
            ]),
            peer("10.0.0.1:443"),
        );

        assert_eq!(id.ip, "203.0.113.7");
        assert_eq!(id.ip_source, IpSource::CdnHeader);
    }

    #[test]
    fn test_real_ip_before_forwarded_for() {
        let resolver = IdentityResolver::default();
        let id = resolver.resolve(
            &headers(&[("x-real-ip", "198.51.100.1"), ("x-forwarded-for", "192.0.2.1")]),
            None,
        );

        assert_eq!(id.ip, "198.51.100.1");
        assert_eq!(id.ip_source, IpSource::ProxyHeader);
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let resolver = IdentityResolver::default();
        let id = resolver.resolve(
            &headers(&[("x-forwarded-for", "  192.168.1.1  , 10.0.0.1")]),
            None,
        );

        assert_eq!(id.ip, "192.168.1.1");
    }

    #[test]
    fn test_invalid_candidates_are_skipped() {
        let resolver = IdentityResolver::default();
        let id = resolver.resolve(
            &headers(&[
                ("cf-connecting-ip", "not-an-ip"),
                ("x-forwarded-for", "192.168.1.1:8080, 10.0.0.1"),
            ]),
            peer("203.0.113.9:5000"),
        );

        assert_eq!(id.ip, "203.0.113.9");
        assert_eq!(id.ip_source, IpSource::Direct);
    }

    #[test]
    fn test_unknown_sentinel() {
        let resolver = IdentityResolver::default();
        let id = resolver.resolve(&HeaderMap::new(), None);

        assert_eq!(id.ip, UNKNOWN_IP);
        assert!(id.is_unresolved());
        assert!(id.ip_addr().is_none());
    }

    #[test]
    fn test_ipv4_mapped_is_canonicalized() {
        let resolver = IdentityResolver::default();
        let id = resolver.resolve(&headers(&[("x-real-ip", "::ffff:192.0.2.44")]), None);

        assert_eq!(id.ip, "192.0.2.44");
    }

    #[test]
    fn test_ipv6_literal() {
        let resolver = IdentityResolver::default();
        let id = resolver.resolve(&headers(&[("x-forwarded-for", "2001:db8::1, 10.0.0.1")]), None);

        assert_eq!(id.ip, "2001:db8::1");
    }

    #[test]
    fn test_untrusted_peer_headers_ignored() {
        let resolver =
            IdentityResolver::new(TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]));
        let id = resolver.resolve(
            &headers(&[("x-forwarded-for", "192.0.2.1")]),
            peer("203.0.113.50:1234"),
        );

        assert_eq!(id.ip, "203.0.113.50");
        assert_eq!(id.ip_source, IpSource::Direct);
        assert!(!id.is_trusted_proxy);
    }

    #[test]
    fn test_trusted_peer_headers_honoured() {
        let resolver =
            IdentityResolver::new(TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]));
        let id = resolver.resolve(
            &headers(&[("x-forwarded-for", "192.0.2.1")]),
            peer("10.1.2.3:1234"),
        );

        assert_eq!(id.ip, "192.0.2.1");
        assert!(id.is_trusted_proxy);
    }

    #[test]
    fn test_resolve_request_reads_connect_info() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("198.51.100.20:4000".parse().unwrap()));

        let id = IdentityResolver::default().resolve_request(&req);
        assert_eq!(id.ip, "198.51.100.20");
        assert_eq!(id.ip_source, IpSource::Direct);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let h = headers(&[("user-agent", "Mozilla/5.0"), ("accept-language", "en-US")]);
        let a = device_fingerprint(&h, "192.0.2.1");
        let b = device_fingerprint(&h, "192.0.2.1");

        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_varies_with_ip() {
        let h = headers(&[("user-agent", "Mozilla/5.0")]);
        assert_ne!(
            device_fingerprint(&h, "192.0.2.1"),
            device_fingerprint(&h, "192.0.2.2")
        );
    }

    #[test]
    fn test_trusted_proxy_config_parsing() {
        let config = TrustedProxyConfig::new(&[
            "10.0.0.0/8".to_string(),
            "192.168.1.1".to_string(),
            "not-a-cidr".to_string(),
            "10.0.0.0/33".to_string(),
        ]);

        assert!(config.is_enabled());
        assert!(config.contains(&"10.255.255.255".parse().unwrap()));
        assert!(config.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!config.contains(&"192.168.1.2".parse().unwrap()));
        assert!(!config.contains(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config_empty() {
        let config = TrustedProxyConfig::new(&[]);
        assert!(!config.is_enabled());
    }
}
