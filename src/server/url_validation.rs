use crate::error::RelayError;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Validate that a relay target is safe to fetch.
///
/// Only `http://` and `https://` URLs with a host are accepted. When
/// `block_private` is set, IP-literal hosts in loopback, private or
/// link-local ranges are rejected as well (SSRF protection for deployments
/// exposed to untrusted clients). Hostnames are accepted without DNS
/// resolution, so DNS rebinding is not covered.
///
/// # Errors
/// Returns [`RelayError::InvalidOrigin`] for:
/// - Non-HTTP(S) schemes
/// - URLs without a host
/// - Blocked IPv4/IPv6 literals when `block_private` is set
pub fn validate_target_url(url: &Url, block_private: bool) -> Result<(), RelayError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(RelayError::InvalidOrigin(format!(
                "Scheme '{scheme}' not allowed, only http/https permitted"
            )));
        }
    }

    let host = url
        .host()
        .ok_or_else(|| RelayError::InvalidOrigin(format!("No host in URL: {url}")))?;

    if !block_private {
        return Ok(());
    }

    match host {
        Host::Ipv4(ip) if is_blocked_ipv4(ip) => Err(RelayError::InvalidOrigin(format!(
            "Private or reserved IPv4 address not allowed: {ip}"
        ))),
        Host::Ipv6(ip) if is_blocked_ipv6(ip) => Err(RelayError::InvalidOrigin(format!(
            "Private or reserved IPv6 address not allowed: {ip}"
        ))),
        _ => Ok(()),
    }
}

/// Returns `true` for IPv4 addresses in private or reserved ranges.
///
/// Blocked ranges:
/// - `0.0.0.0/8`     : "this" network (RFC 1122)
/// - `10.0.0.0/8`    : RFC 1918 private
/// - `127.0.0.0/8`   : loopback
/// - `169.254.0.0/16`: link-local / cloud-metadata
/// - `172.16.0.0/12` : RFC 1918 private
/// - `192.168.0.0/16`: RFC 1918 private
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();

    a == 0
        || a == 10
        || a == 127
        || (a == 169 && b == 254)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
}

/// Returns `true` for IPv6 loopback, link-local (`fe80::/10`) and
/// unique-local (`fc00::/7`) addresses.
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    let s = ip.segments();

    ip.is_loopback() || (s[0] & 0xffc0) == 0xfe80 || (s[0] & 0xfe00) == 0xfc00
}
