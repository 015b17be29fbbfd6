//! Small parsing and classification helpers shared across the proxy.
//!
//! Address and URL handling is deliberately minimal: registration addresses
//! are `host[:port]` pairs, and the only URL surgery the proxy performs is
//! netloc extraction and path joining.

use std::net::{IpAddr, ToSocketAddrs};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Parses an instance address of the form `host[:port]`.
///
/// An address without a port (or with a non-numeric port segment) leaves the
/// port as `None`.
pub fn parse_address(address: &str) -> (String, Option<u16>) {
    if let Some((host, port)) = address.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), Some(port));
        }
    }
    (address.to_string(), None)
}

/// Splits an absolute URL into `(netloc, path_and_rest)`.
///
/// Returns `None` for scheme-less inputs, which the registration flow treats
/// as bare paths to be composed onto `http://<address>`.
pub fn split_netloc(url: &str) -> Option<(&str, &str)> {
    let rest = url.split_once("://")?.1;
    match rest.find('/') {
        Some(idx) => Some((&rest[..idx], &rest[idx..])),
        None => Some((rest, "")),
    }
}

/// Joins a base URL and a path without doubling or dropping slashes.
pub fn url_join(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

/// Whether the IP belongs to a private (RFC1918), loopback or link-local
/// range. Used for the `PRIVATE` cluster policy.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Whether the IP is globally routable. `Ipv4Addr::is_global` is unstable,
/// so the v4 ranges are enumerated here.
pub fn is_global_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_documentation()
                // 100.64/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64))
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() || is_private_ip(ip))
        }
    }
}

/// Extracts the host portion of a URL (no port, no userinfo).
pub fn url_host(url: &str) -> Option<String> {
    let (netloc, _) = split_netloc(url)?;
    let netloc = netloc.rsplit_once('@').map(|(_, h)| h).unwrap_or(netloc);
    let (host, _) = parse_address(netloc);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Resolves the host of a URL to an IP address.
///
/// Literal IPs resolve without a lookup; host names go through the system
/// resolver. Returns `None` when the URL has no netloc or resolution fails.
pub fn resolve_url_ip(url: &str) -> Option<IpAddr> {
    let host = url_host(url)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    (host.as_str(), 80)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip())
}

/// Hop-by-hop headers defined by RFC 7230 §6.1, which an intermediary must
/// not forward. `proxy-authorization` is consumed by the engine itself.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether the header name is hop-by-hop.
pub fn is_hop_by_hop(header: &str) -> bool {
    let lower = header.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || lower.starts_with("proxy-")
}

/// Serializes a JSON value with object keys sorted, so that logically equal
/// payloads always produce the same byte sequence.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Case-sensitive compressed fingerprint of a string: sha-256, base64url,
/// truncated to 16 characters.
pub fn fast_digest(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(16);
    encoded
}

/// Fingerprint of a JSON value through its canonical encoding.
pub fn resources_etag(resources: &Value) -> String {
    fast_digest(&canonical_json(resources))
}

/// Unix timestamp in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether the host names the local machine.
pub fn is_loopback_host(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn address_with_port() {
        let (host, port) = parse_address("10.0.0.5:8000");
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, Some(8000));
    }

    #[test]
    fn address_without_port_leaves_port_null() {
        let (host, port) = parse_address("10.0.0.5");
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, None);
    }

    #[test]
    fn address_with_bad_port_segment() {
        let (host, port) = parse_address("service.internal:http");
        assert_eq!(host, "service.internal:http");
        assert_eq!(port, None);
    }

    #[test]
    fn netloc_split() {
        assert_eq!(
            split_netloc("http://10.0.0.1:8000/api/v1"),
            Some(("10.0.0.1:8000", "/api/v1"))
        );
        assert_eq!(
            split_netloc("http://10.0.0.1:8000"),
            Some(("10.0.0.1:8000", ""))
        );
        assert_eq!(split_netloc("/api/ops"), None);
        assert_eq!(split_netloc("api/ops"), None);
    }

    #[test]
    fn url_join_slash_handling() {
        assert_eq!(
            url_join("http://10.0.0.1:8000/", "/api/ops"),
            "http://10.0.0.1:8000/api/ops"
        );
        assert_eq!(
            url_join("http://10.0.0.1:8000", "api/ops"),
            "http://10.0.0.1:8000/api/ops"
        );
        assert_eq!(url_join("http://10.0.0.1:8000", ""), "http://10.0.0.1:8000");
    }

    #[test]
    fn private_ip_classification() {
        assert!(is_private_ip(&"10.0.0.1".parse().unwrap()));
        assert!(is_private_ip(&"192.168.1.4".parse().unwrap()));
        assert!(is_private_ip(&"172.20.0.9".parse().unwrap()));
        assert!(is_private_ip(&"127.0.0.1".parse().unwrap()));
        assert!(!is_private_ip(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn global_ip_classification() {
        assert!(is_global_ip(&"8.8.8.8".parse().unwrap()));
        assert!(!is_global_ip(&"10.0.0.1".parse().unwrap()));
        assert!(!is_global_ip(&"127.0.0.1".parse().unwrap()));
        assert!(!is_global_ip(&"169.254.3.1".parse().unwrap()));
    }

    #[test]
    fn url_host_extraction() {
        assert_eq!(
            url_host("http://proxy.cluster:9090/base"),
            Some("proxy.cluster".to_string())
        );
        assert_eq!(url_host("https://10.2.0.4"), Some("10.2.0.4".to_string()));
        assert_eq!(url_host("/relative/path"), None);
    }

    #[test]
    fn hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(is_hop_by_hop("proxy-anything"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("authorization"));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"y": 2, "x": [3, 4]}});
        let b = json!({"a": {"x": [3, 4], "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":[3,4],"y":2},"b":1}"#);
    }

    #[test]
    fn digest_is_stable_and_compressed() {
        let value = json!({"instances": [{"ident": "10.0.0.1:8000"}]});
        let first = resources_etag(&value);
        let second = resources_etag(&value);
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn digest_is_case_sensitive() {
        assert_ne!(fast_digest("Resources"), fast_digest("resources"));
    }

    #[test]
    fn loopback_hosts() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("localhost"));
        assert!(!is_loopback_host("10.0.0.1"));
    }
}
