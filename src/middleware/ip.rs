//! Client IP extraction for rate-limit key derivation.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! These functions trust client-provided headers. Per-IP rate limiting is
//! only meaningful when this service sits behind a reverse proxy that
//! overwrites (not appends to) `X-Forwarded-For`, and direct access from the
//! internet is blocked. Configure [`TrustedProxies`] with your proxy's CIDR
//! ranges so spoofed headers from untrusted sources are flagged.
//!
//! # The "unknown" Fallback
//!
//! Requests without identifiable IPs all share the `"unknown"` key, so they
//! are collectively rate-limited rather than individually unlimited. Monitor
//! for high "unknown" traffic in production.

use std::borrow::Cow;
use std::net::IpAddr;

use axum::http::Request;
use tracing::{debug, warn};

/// Fallback key component when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse CIDR notation ("10.0.0.0/8", "::1/128") or a bare IP
    /// (implicit /32 or /128). Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let trimmed = cidr.trim();

        let (ip_part, prefix_part) = match trimmed.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (trimmed, None),
        };

        let network: IpAddr = ip_part.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match prefix_part {
            Some(p) => p.parse().ok()?,
            None => max_prefix,
        };

        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // IPv4 and IPv6 never match each other
            _ => false,
        }
    }
}

/// Trusted proxy CIDR ranges.
///
/// Empty configuration trusts all sources (development mode); any configured
/// range enables validation of forwarded-IP header provenance.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    ranges: Vec<CidrRange>,
}

impl TrustedProxies {
    /// Parse CIDR strings; invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in trusted proxies, skipping");
                }
                parsed
            })
            .collect();

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether an IP belongs to a trusted proxy. With no ranges configured,
    /// every source is trusted.
    pub fn is_trusted(&self, ip_str: &str) -> bool {
        if self.ranges.is_empty() {
            return true;
        }

        let Ok(ip) = ip_str.parse::<IpAddr>() else {
            return false;
        };

        self.ranges.iter().any(|range| range.contains(&ip))
    }
}

/// Extract the client IP from forwarded-IP headers.
///
/// Checks `X-Forwarded-For` (first entry in the list) then `X-Real-IP`,
/// falling back to [`UNKNOWN_IP`]. When trusted proxy validation is enabled,
/// untrusted forwarded values are logged for spoofing detection.
pub fn client_ip<B>(req: &Request<B>, trusted: &TrustedProxies) -> Cow<'static, str> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
    {
        let ip = first.trim();
        if trusted.is_enabled() && !trusted.is_trusted(ip) {
            debug!(ip = %ip, "X-Forwarded-For value outside trusted proxy ranges");
        }
        return Cow::Owned(ip.to_string());
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return Cow::Owned(value.trim().to_string());
    }

    Cow::Borrowed(UNKNOWN_IP)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        // Bare IP implies the full prefix
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
    }

    #[test]
    fn test_cidr_parse_invalid() {
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("10.0.0.0/8").unwrap();
        assert!(cidr.contains(&"10.0.0.1".parse().unwrap()));
        assert!(cidr.contains(&"10.255.255.255".parse().unwrap()));
        assert!(!cidr.contains(&"11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxies_empty_trusts_all() {
        let trusted = TrustedProxies::new(&[]);
        assert!(!trusted.is_enabled());
        assert!(trusted.is_trusted("1.2.3.4"));
        assert!(trusted.is_trusted("garbage"));
    }

    #[test]
    fn test_trusted_proxies_with_ranges() {
        let trusted = TrustedProxies::new(&["10.0.0.0/8".to_string()]);
        assert!(trusted.is_enabled());
        assert!(trusted.is_trusted("10.1.2.3"));
        assert!(!trusted.is_trusted("8.8.8.8"));
        assert!(!trusted.is_trusted("garbage"));
    }

    #[test]
    fn test_client_ip_from_forwarded_for() {
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.50, 70.41.3.18")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req, &TrustedProxies::default()), "203.0.113.50");
    }

    #[test]
    fn test_client_ip_from_real_ip() {
        let req = Request::builder()
            .header("x-real-ip", "198.51.100.7")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req, &TrustedProxies::default()), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_fallback() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&req, &TrustedProxies::default()), UNKNOWN_IP);
    }
}
