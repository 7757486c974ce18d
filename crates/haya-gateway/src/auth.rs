//! Token authentication: credential extraction, constant-time comparison,
//! and proxy-aware client-IP resolution.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use tracing::debug;

use haya_core::config::{parse_ip_or_cidr, IpNetwork};

use crate::ratelimit::is_loopback;

/// Loopback-only fallback header for the HTTP shim when TLS is off.
pub const TOKEN_HEADER: &str = "x-haya-token";

/// Constant-time comparison over equal-length byte slices; unequal lengths
/// fail before any byte is read.
pub fn constant_time_token_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Pull the presented credential out of a request, in priority order:
/// `Authorization: Bearer`, a `token` query parameter, and (loopback
/// without TLS only) the `X-Haya-Token` header.
pub fn extract_credential(
    headers: &HeaderMap,
    query: Option<&str>,
    client_ip: IpAddr,
    tls_enabled: bool,
) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if k == "token" {
                    return Some(v.to_string());
                }
            }
        }
    }
    if !tls_enabled && is_loopback(client_ip) {
        if let Some(value) = headers.get(TOKEN_HEADER) {
            if let Ok(value) = value.to_str() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Resolve the client IP: the socket remote unless it is a trusted proxy,
/// in which case the leftmost `X-Forwarded-For` entry (or `X-Real-IP`) is
/// honored.
pub fn resolve_client_ip(
    remote: SocketAddr,
    headers: &HeaderMap,
    trusted_proxies: &[IpNetwork],
) -> IpAddr {
    let socket_ip = remote.ip();
    let trusted = trusted_proxies.iter().any(|net| net.contains(socket_ip));
    if !trusted {
        return socket_ip;
    }

    if let Some(value) = headers.get("x-forwarded-for") {
        if let Ok(value) = value.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }
    if let Some(value) = headers.get("x-real-ip") {
        if let Ok(value) = value.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }
    debug!(%socket_ip, "trusted proxy sent no forwarding header");
    socket_ip
}

/// Parse configured proxy strings once at boot. Invalid entries were
/// already rejected by config validation.
pub fn parse_trusted_proxies(entries: &[String]) -> Vec<IpNetwork> {
    entries
        .iter()
        .filter_map(|e| parse_ip_or_cidr(e))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn unequal_lengths_fail_fast() {
        assert!(!constant_time_token_eq("short", "a-much-longer-token"));
        assert!(!constant_time_token_eq("", "x"));
    }

    #[test]
    fn equal_tokens_match() {
        let t = "f".repeat(64);
        assert!(constant_time_token_eq(&t, &t.clone()));
        let mut other = t.clone();
        other.replace_range(63..64, "0");
        assert!(!constant_time_token_eq(&t, &other));
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer header-token"),
        );
        let got = extract_credential(
            &headers,
            Some("token=query-token"),
            "10.0.0.1".parse().unwrap(),
            true,
        );
        assert_eq!(got.as_deref(), Some("header-token"));
    }

    #[test]
    fn query_token_used_without_header() {
        let got = extract_credential(
            &HeaderMap::new(),
            Some("foo=1&token=query-token"),
            "10.0.0.1".parse().unwrap(),
            true,
        );
        assert_eq!(got.as_deref(), Some("query-token"));
    }

    #[test]
    fn shim_header_only_on_loopback_without_tls() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("shim-token"));

        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let remote: IpAddr = "10.0.0.1".parse().unwrap();

        assert_eq!(
            extract_credential(&headers, None, loopback, false).as_deref(),
            Some("shim-token")
        );
        assert!(extract_credential(&headers, None, loopback, true).is_none());
        assert!(extract_credential(&headers, None, remote, false).is_none());
    }

    #[test]
    fn forwarded_for_honored_only_from_trusted_proxy() {
        let proxies = parse_trusted_proxies(&["10.0.0.0/8".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.2"),
        );

        let via_proxy: SocketAddr = "10.0.0.2:9999".parse().unwrap();
        assert_eq!(
            resolve_client_ip(via_proxy, &headers, &proxies),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );

        let direct: SocketAddr = "198.51.100.4:1234".parse().unwrap();
        assert_eq!(
            resolve_client_ip(direct, &headers, &proxies),
            "198.51.100.4".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn real_ip_fallback() {
        let proxies = parse_trusted_proxies(&["10.0.0.2".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.33"));
        let via_proxy: SocketAddr = "10.0.0.2:9999".parse().unwrap();
        assert_eq!(
            resolve_client_ip(via_proxy, &headers, &proxies),
            "192.0.2.33".parse::<IpAddr>().unwrap()
        );
    }
}
