//! Trusted-address policy.
//!
//! Decides whether a request's declared remote address may assert
//! administrative bypass headers. Unknown or unparseable addresses are never
//! trusted.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// IPv4 network given as base address and prefix length.
#[derive(Debug, Clone, Copy)]
struct Ipv4Net {
    base: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    const fn new(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Self {
        Self {
            base: Ipv4Addr::new(a, b, c, d),
            prefix,
        }
    }

    fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::MAX
            .checked_shl(32 - u32::from(self.prefix))
            .unwrap_or(0);
        u32::from(addr) & mask == u32::from(self.base) & mask
    }
}

/// Container bridge network the local development server forwards from.
const DEV_NETWORKS: &[Ipv4Net] = &[Ipv4Net::new(172, 17, 0, 0, 16)];

/// Platform front ends that forward production traffic.
const PLATFORM_NETWORKS: &[Ipv4Net] = &[
    Ipv4Net::new(169, 254, 160, 0, 24),
    Ipv4Net::new(169, 254, 169, 0, 24),
];

/// Something that can judge a request's remote address.
pub trait TrustedAddressChecker {
    fn is_trusted_remote_addr(&self, remote_addr: Option<&str>) -> bool;
}

/// Returns whether `remote_addr` is trusted.
///
/// In dev mode loopback and the local container bridge are trusted. In
/// production only the platform's internal front-end networks are.
/// Accepts bare IPs and `ip:port` forms.
#[must_use]
pub fn is_trusted(dev_mode: bool, remote_addr: Option<&str>) -> bool {
    let Some(ip) = remote_addr.and_then(parse_remote_addr) else {
        return false;
    };

    if dev_mode {
        if ip.is_loopback() {
            return true;
        }
        return matches!(ip, IpAddr::V4(v4) if DEV_NETWORKS.iter().any(|n| n.contains(v4)));
    }

    matches!(ip, IpAddr::V4(v4) if PLATFORM_NETWORKS.iter().any(|n| n.contains(v4)))
}

fn parse_remote_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let ip = raw
        .parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))?;
    Some(ip.to_canonical())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn dev_mode_trusts_loopback() {
        assert!(is_trusted(true, Some("127.0.0.1")));
        assert!(is_trusted(true, Some("::1")));
        assert!(is_trusted(true, Some("127.0.0.1:53122")));
        assert!(is_trusted(true, Some("[::1]:8080")));
        assert!(is_trusted(true, Some("::ffff:127.0.0.1")));
    }

    #[test]
    fn dev_mode_trusts_container_bridge() {
        assert!(is_trusted(true, Some("172.17.0.1")));
        assert!(!is_trusted(true, Some("172.18.0.1")));
    }

    #[test]
    fn production_trusts_platform_front_ends_only() {
        assert!(is_trusted(false, Some("169.254.160.2")));
        assert!(is_trusted(false, Some("169.254.169.254")));
        assert!(!is_trusted(false, Some("169.254.170.1")));
        assert!(!is_trusted(false, Some("127.0.0.1")));
        assert!(!is_trusted(false, Some("8.8.8.8")));
    }

    #[test]
    fn unknown_address_is_untrusted() {
        assert!(!is_trusted(true, None));
        assert!(!is_trusted(false, None));
        assert!(!is_trusted(true, Some("")));
        assert!(!is_trusted(true, Some("localhost")));
        assert!(!is_trusted(false, Some("not-an-ip")));
    }

    proptest! {
        #[test]
        fn public_ipv4_is_never_trusted_in_production(a in 1u8..=126, b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) {
            let addr = Ipv4Addr::new(a, b, c, d).to_string();
            prop_assert!(!is_trusted(false, Some(&addr)));
        }

        #[test]
        fn whole_loopback_block_is_trusted_in_dev(b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) {
            let addr = Ipv4Addr::new(127, b, c, d).to_string();
            prop_assert!(is_trusted(true, Some(&addr)));
        }

        #[test]
        fn arbitrary_text_never_panics(s in ".{0,40}") {
            let _ = is_trusted(true, Some(&s));
            let _ = is_trusted(false, Some(&s));
        }
    }
}
