//! Identifier handling: normalization, DNS name syntax, and the private
//! address guard applied before any validation traffic leaves the server.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

pub const IDENTIFIER_TYPE_DNS: &str = "dns";

/// An ACME identifier (`{"type": "dns", "value": "example.com"}`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: IDENTIFIER_TYPE_DNS.to_string(),
            value: value.into(),
        }
    }

    pub fn is_dns(&self) -> bool {
        self.kind == IDENTIFIER_TYPE_DNS
    }
}

/// Lower-case the name and strip surrounding whitespace and a trailing root dot
pub fn normalize_dns_name(value: &str) -> String {
    let trimmed = value.trim();
    trimmed
        .strip_suffix('.')
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

/// Check DNS name syntax
///
/// Labels are 1-63 characters of ASCII letters, digits and hyphens, and may
/// not start or end with a hyphen. The whole name is at most 253 characters.
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

pub fn is_wildcard(name: &str) -> bool {
    name.starts_with("*.")
}

pub fn is_localhost(name: &str) -> bool {
    name == "localhost" || name.ends_with(".localhost")
}

/// Returns true if the address must never be the target of a validation request
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_v4(&mapped);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Reject identifiers that would point validation at an internal target
///
/// Returns the reason when the identifier is an IP literal in a private,
/// loopback or link-local range, or a `localhost` name outside dev mode.
pub fn private_target_reason(value: &str, dev_mode: bool) -> Option<String> {
    let host = value.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_address(&ip) {
            return Some(format!("{} is a private or internal address", value));
        }
    }

    if !dev_mode && is_localhost(value) {
        return Some(format!("{} is not a public name", value));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_dns_name(" Example.COM. "), "example.com");
        assert_eq!(normalize_dns_name("a.b"), "a.b");
    }

    #[test]
    fn test_dns_name_rules() {
        assert!(is_valid_dns_name("example.com"));
        assert!(is_valid_dns_name("a-b.example.com"));
        assert!(is_valid_dns_name("xn--bcher-kva.example"));
        assert!(!is_valid_dns_name(""));
        assert!(!is_valid_dns_name("-bad.example.com"));
        assert!(!is_valid_dns_name("bad-.example.com"));
        assert!(!is_valid_dns_name("a..b"));
        assert!(!is_valid_dns_name("under_score.com"));
        assert!(!is_valid_dns_name(&format!("{}.com", "a".repeat(64))));
        assert!(is_valid_dns_name(&format!("{}.com", "a".repeat(63))));
        assert!(!is_valid_dns_name("*.example.com"));
    }

    #[test]
    fn test_private_addresses() {
        for ip in [
            "10.0.0.5",
            "172.16.1.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.1.1",
            "100.64.0.1",
            "0.0.0.0",
            "::1",
            "fd00::1",
            "fe80::1",
            "::ffff:10.0.0.1",
        ] {
            let parsed: IpAddr = ip.parse().unwrap();
            assert!(is_private_address(&parsed), "{} should be private", ip);
        }

        for ip in ["8.8.8.8", "1.1.1.1", "2001:4860:4860::8888"] {
            let parsed: IpAddr = ip.parse().unwrap();
            assert!(!is_private_address(&parsed), "{} should be public", ip);
        }
    }

    #[test]
    fn test_private_target_reason() {
        assert!(private_target_reason("10.0.0.5", false).is_some());
        assert!(private_target_reason("10.0.0.5", true).is_some());
        assert!(private_target_reason("localhost", false).is_some());
        assert!(private_target_reason("localhost", true).is_none());
        assert!(private_target_reason("example.com", false).is_none());
    }
}
