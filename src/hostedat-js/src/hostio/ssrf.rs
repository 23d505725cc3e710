//! The SSRF guard for outbound fetch and TCP.
//!
//! DNS is resolved exactly once and the connection dials the validated
//! IP, so a rebinding name cannot pass the check with one address and
//! connect to another. Literal IPs are checked directly.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Names the forbidden range an address falls in, or `None` when the
/// address is safe to dial.
pub(crate) fn forbidden_range(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => forbidden_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return forbidden_v4(mapped);
            }
            forbidden_v6(v6)
        }
    }
}

fn forbidden_v4(ip: Ipv4Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        return Some("loopback (127.0.0.0/8)");
    }
    if ip.is_private() {
        return Some("private (RFC 1918)");
    }
    if ip.is_link_local() {
        return Some("link-local (169.254.0.0/16)");
    }
    if ip.is_unspecified() {
        return Some("unspecified (0.0.0.0)");
    }
    if ip.is_broadcast() {
        return Some("broadcast (255.255.255.255)");
    }
    // carrier-grade NAT
    if ip.octets()[0] == 100 && (64..128).contains(&ip.octets()[1]) {
        return Some("shared address space (100.64.0.0/10)");
    }
    None
}

fn forbidden_v6(ip: Ipv6Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        return Some("loopback (::1)");
    }
    if ip.is_unspecified() {
        return Some("unspecified (::)");
    }
    // fc00::/7 unique local
    if (ip.segments()[0] & 0xfe00) == 0xfc00 {
        return Some("unique local (fc00::/7)");
    }
    // fe80::/10 link local
    if (ip.segments()[0] & 0xffc0) == 0xfe80 {
        return Some("link-local (fe80::/10)");
    }
    None
}

/// Resolves a hostname once and verifies the address it yields.
/// Returns the validated socket address the caller must dial.
pub(crate) async fn resolve_checked(host: &str, port: u16) -> Result<SocketAddr, String> {
    let lowered = host.to_ascii_lowercase();
    let trimmed = lowered.trim_matches(['[', ']']);
    if trimmed == "localhost" || trimmed.ends_with(".localhost") {
        return Err(format!(
            "refusing to connect to {host:?}: localhost is not reachable from workers"
        ));
    }

    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        if let Some(range) = forbidden_range(ip) {
            return Err(format!(
                "refusing to connect to {ip}: address is in the {range} range"
            ));
        }
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = tokio::net::lookup_host((trimmed, port))
        .await
        .map_err(|e| format!("failed to resolve {host:?}: {e}"))?;
    let addr = addrs
        .next()
        .ok_or_else(|| format!("failed to resolve {host:?}: no addresses"))?;
    if let Some(range) = forbidden_range(addr.ip()) {
        return Err(format!(
            "refusing to connect to {host:?} ({ip}): address is in the {range} range",
            ip = addr.ip()
        ));
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_private_ranges_are_refused() {
        assert!(forbidden_range("127.0.0.1".parse().unwrap()).is_some());
        assert!(forbidden_range("10.1.2.3".parse().unwrap()).is_some());
        assert!(forbidden_range("172.16.0.1".parse().unwrap()).is_some());
        assert!(forbidden_range("192.168.1.1".parse().unwrap()).is_some());
        assert!(forbidden_range("169.254.10.10".parse().unwrap()).is_some());
        assert!(forbidden_range("100.64.0.1".parse().unwrap()).is_some());
        assert!(forbidden_range("::1".parse().unwrap()).is_some());
        assert!(forbidden_range("fe80::1".parse().unwrap()).is_some());
        assert!(forbidden_range("fd00::1".parse().unwrap()).is_some());
    }

    #[test]
    fn public_addresses_pass() {
        assert!(forbidden_range("93.184.216.34".parse().unwrap()).is_none());
        assert!(forbidden_range("2606:2800:220:1::1".parse().unwrap()).is_none());
    }

    #[test]
    fn mapped_v4_is_unwrapped() {
        assert!(forbidden_range("::ffff:127.0.0.1".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn localhost_names_are_refused_before_dns() {
        let err = resolve_checked("localhost", 80).await.unwrap_err();
        assert!(err.contains("localhost"), "{err}");
        let err = resolve_checked("foo.localhost", 80).await.unwrap_err();
        assert!(err.contains("localhost"), "{err}");
    }

    #[tokio::test]
    async fn literal_loopback_is_refused() {
        let err = resolve_checked("127.0.0.1", 80).await.unwrap_err();
        assert!(err.contains("loopback"), "{err}");
    }
}
