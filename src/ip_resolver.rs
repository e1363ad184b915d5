// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client Address Resolution
//!
//! Derives the client key used for rate limiting and statistics. Proxy
//! headers are only honoured when explicitly trusted, and even then only if
//! they contain a syntactically valid IP address, so a forged header cannot
//! mint arbitrary keys.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Extracts the client key from request metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpResolver {
    trust_proxy: bool,
}

impl IpResolver {
    /// Creates a resolver. With `trust_proxy`, `X-Forwarded-For` and
    /// `X-Real-IP` are consulted before the peer address.
    pub fn new(trust_proxy: bool) -> Self {
        IpResolver { trust_proxy }
    }

    /// Returns the canonical client key for a request.
    pub fn client_key(&self, headers: &HeaderMap, peer: SocketAddr) -> String {
        if self.trust_proxy {
            let forwarded = header_str(headers, X_FORWARDED_FOR)
                .and_then(|xff| xff.split(',').next())
                .and_then(parse_ip);
            if let Some(ip) = forwarded {
                return ip.to_string();
            }

            if let Some(ip) = header_str(headers, X_REAL_IP).and_then(parse_ip) {
                return ip.to_string();
            }
        }

        peer.ip().to_string()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_ip(candidate: &str) -> Option<IpAddr> {
    candidate.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.0.2.10:54321".parse().unwrap()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_peer_address_without_port() {
        let resolver = IpResolver::new(false);
        assert_eq!(resolver.client_key(&HeaderMap::new(), peer()), "192.0.2.10");
    }

    #[test]
    fn test_ipv6_peer() {
        let resolver = IpResolver::new(false);
        let peer: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        assert_eq!(resolver.client_key(&HeaderMap::new(), peer), "2001:db8::1");
    }

    #[test]
    fn test_untrusted_headers_are_ignored() {
        let resolver = IpResolver::new(false);
        let h = headers(&[("x-forwarded-for", "203.0.113.5"), ("x-real-ip", "203.0.113.6")]);
        assert_eq!(resolver.client_key(&h, peer()), "192.0.2.10");
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let resolver = IpResolver::new(true);
        let h = headers(&[("x-forwarded-for", " 203.0.113.5 , 10.0.0.1, 10.0.0.2")]);
        assert_eq!(resolver.client_key(&h, peer()), "203.0.113.5");
    }

    #[test]
    fn test_invalid_forwarded_for_falls_back_to_real_ip() {
        let resolver = IpResolver::new(true);
        let h = headers(&[
            ("x-forwarded-for", "not-an-ip, 203.0.113.5"),
            ("x-real-ip", "203.0.113.6"),
        ]);
        assert_eq!(resolver.client_key(&h, peer()), "203.0.113.6");
    }

    #[test]
    fn test_invalid_headers_fall_back_to_peer() {
        let resolver = IpResolver::new(true);
        let h = headers(&[
            ("x-forwarded-for", "<script>"),
            ("x-real-ip", "999.1.1.1"),
        ]);
        assert_eq!(resolver.client_key(&h, peer()), "192.0.2.10");
    }

    #[test]
    fn test_trusted_without_headers_uses_peer() {
        let resolver = IpResolver::new(true);
        assert_eq!(resolver.client_key(&HeaderMap::new(), peer()), "192.0.2.10");
    }

    #[test]
    fn test_ipv6_forwarded_for() {
        let resolver = IpResolver::new(true);
        let h = headers(&[("x-forwarded-for", "2001:db8::42")]);
        assert_eq!(resolver.client_key(&h, peer()), "2001:db8::42");
    }
}
