//! Network address scope classification.
//!
//! Decides whether an address is reachable only from this machine, only
//! on the local link, across the private cloud fabric, or from the public
//! internet. Peer discovery and bind-address selection only ever use
//! [`Scope::CloudLocal`] addresses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Reachability scope of a network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// Loopback, or the literal `localhost`.
    MachineLocal,
    /// Link-local autoconfiguration ranges.
    LinkLocal,
    /// Private ranges routable inside the cloud network.
    CloudLocal,
    /// Globally routable.
    Public,
    /// Hostnames, multicast, unspecified and broadcast addresses.
    Unknown,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::MachineLocal => "machine-local",
            Scope::LinkLocal => "link-local",
            Scope::CloudLocal => "cloud-local",
            Scope::Public => "public",
            Scope::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classify an IP address.
pub fn classify_ip(ip: IpAddr) -> Scope {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => classify_v4(v4),
            None => classify_v6(v6),
        },
    }
}

/// Classify a bare host (IP literal or hostname, no port).
pub fn classify_host(host: &str) -> Scope {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => classify_ip(ip),
        Err(_) if trimmed.eq_ignore_ascii_case("localhost") => Scope::MachineLocal,
        Err(_) => Scope::Unknown,
    }
}

fn classify_v4(ip: Ipv4Addr) -> Scope {
    let octets = ip.octets();
    if ip.is_loopback() {
        Scope::MachineLocal
    } else if ip.is_link_local() {
        Scope::LinkLocal
    } else if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        Scope::Unknown
    } else if ip.is_private() || (octets[0] == 100 && (octets[1] & 0xc0) == 64) {
        // 100.64.0.0/10 is carrier-grade shared space, private to the fabric.
        Scope::CloudLocal
    } else {
        Scope::Public
    }
}

fn classify_v6(ip: Ipv6Addr) -> Scope {
    let first = ip.segments()[0];
    if ip.is_loopback() {
        Scope::MachineLocal
    } else if (first & 0xffc0) == 0xfe80 {
        Scope::LinkLocal
    } else if ip.is_unspecified() || ip.is_multicast() {
        Scope::Unknown
    } else if (first & 0xfe00) == 0xfc00 {
        Scope::CloudLocal
    } else {
        Scope::Public
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(addr: &str) -> Result<(String, u16), AddressError> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| AddressError::MissingPort(addr.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| AddressError::MissingPort(addr.to_string()))?;
        (host, port)
    } else {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(addr.to_string()))?;
        // A bare IPv6 literal without brackets has no separable port.
        if host.contains(':') {
            return Err(AddressError::MissingPort(addr.to_string()));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(AddressError::EmptyHost(addr.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(addr.to_string()))?;
    Ok((host.to_string(), port))
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_v4_is_cloud_local() {
        for host in ["10.0.0.5", "172.16.3.4", "172.31.255.1", "192.168.1.1", "100.64.0.1"] {
            assert_eq!(classify_host(host), Scope::CloudLocal, "{host}");
        }
    }

    #[test]
    fn v4_edge_ranges() {
        assert_eq!(classify_host("127.0.0.1"), Scope::MachineLocal);
        assert_eq!(classify_host("169.254.10.1"), Scope::LinkLocal);
        assert_eq!(classify_host("172.32.0.1"), Scope::Public);
        assert_eq!(classify_host("100.128.0.1"), Scope::Public);
        assert_eq!(classify_host("8.8.8.8"), Scope::Public);
        assert_eq!(classify_host("0.0.0.0"), Scope::Unknown);
        assert_eq!(classify_host("224.0.0.1"), Scope::Unknown);
    }

    #[test]
    fn v6_ranges() {
        assert_eq!(classify_host("::1"), Scope::MachineLocal);
        assert_eq!(classify_host("fe80::1"), Scope::LinkLocal);
        assert_eq!(classify_host("fd00::5"), Scope::CloudLocal);
        assert_eq!(classify_host("[fd00::5]"), Scope::CloudLocal);
        assert_eq!(classify_host("2001:db8::1"), Scope::Public);
        assert_eq!(classify_host("::ffff:10.1.2.3"), Scope::CloudLocal);
    }

    #[test]
    fn hostnames() {
        assert_eq!(classify_host("localhost"), Scope::MachineLocal);
        assert_eq!(classify_host("LOCALHOST"), Scope::MachineLocal);
        assert_eq!(classify_host("controller-0.internal"), Scope::Unknown);
    }

    #[test]
    fn split_v4_and_hostname() {
        assert_eq!(
            split_host_port("10.0.0.5:17070").unwrap(),
            ("10.0.0.5".to_string(), 17070)
        );
        assert_eq!(
            split_host_port("localhost:17070").unwrap(),
            ("localhost".to_string(), 17070)
        );
    }

    #[test]
    fn split_bracketed_v6() {
        assert_eq!(
            split_host_port("[fd00::5]:17070").unwrap(),
            ("fd00::5".to_string(), 17070)
        );
    }

    #[test]
    fn split_rejects_bad_input() {
        assert!(matches!(split_host_port("10.0.0.5"), Err(AddressError::MissingPort(_))));
        assert!(matches!(split_host_port("fd00::5"), Err(AddressError::MissingPort(_))));
        assert!(matches!(split_host_port(":17070"), Err(AddressError::EmptyHost(_))));
        assert!(matches!(split_host_port("10.0.0.5:http"), Err(AddressError::InvalidPort(_))));
        assert!(matches!(split_host_port("10.0.0.5:70000"), Err(AddressError::InvalidPort(_))));
    }

    #[test]
    fn join_brackets_v6_only() {
        assert_eq!(join_host_port("10.0.0.9", 17666), "10.0.0.9:17666");
        assert_eq!(join_host_port("fd00::9", 17666), "[fd00::9]:17666");
    }
}
