//! Bind address selection.
//!
//! Picks the single cloud-local address this node advertises to its
//! peers. Loopback devices and local hypervisor bridges are skipped, the
//! remaining cloud-local addresses are sorted, and the first one wins.
//! The choice is memoized per [`AddressSelector`] so repeated callers
//! always observe the same address.

use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Mutex;

use nix::net::if_::InterfaceFlags;
use quorum_core::{Scope, classify_ip};
use tracing::{debug, info};

use crate::error::{ClusterError, ClusterResult};

/// Bridge devices created by local container and VM hypervisors.
/// Their addresses are never reachable from other machines.
pub const DEFAULT_IGNORED_BRIDGES: &[&str] = &["lxdbr0", "virbr0", "lxcbr0", "docker0"];

/// A network interface and the IP addresses bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub loopback: bool,
    pub addresses: Vec<IpAddr>,
}

impl NetInterface {
    pub fn new(name: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            name: name.into(),
            loopback: false,
            addresses,
        }
    }

    pub fn loopback(name: impl Into<String>, addresses: Vec<IpAddr>) -> Self {
        Self {
            name: name.into(),
            loopback: true,
            addresses,
        }
    }
}

/// Source of local network interfaces, injected so tests can fake them.
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> ClusterResult<Vec<NetInterface>>;
}

/// Reads interfaces from the operating system via `getifaddrs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> ClusterResult<Vec<NetInterface>> {
        let addrs =
            nix::ifaddrs::getifaddrs().map_err(|e| ClusterError::Interfaces(e.to_string()))?;

        // getifaddrs yields one entry per (interface, address); fold them
        // back into interfaces while keeping the kernel's order.
        let mut interfaces: Vec<NetInterface> = Vec::new();
        for ifaddr in addrs {
            let ip = ifaddr.address.as_ref().and_then(|storage| {
                if let Some(sin) = storage.as_sockaddr_in() {
                    Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()))
                } else {
                    storage
                        .as_sockaddr_in6()
                        .map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
                }
            });

            let index = match interfaces
                .iter()
                .position(|i| i.name == ifaddr.interface_name)
            {
                Some(index) => index,
                None => {
                    interfaces.push(NetInterface {
                        name: ifaddr.interface_name.clone(),
                        loopback: ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                        addresses: Vec::new(),
                    });
                    interfaces.len() - 1
                }
            };
            if let Some(ip) = ip {
                interfaces[index].addresses.push(ip);
            }
        }

        Ok(interfaces)
    }
}

/// Chooses and memoizes this node's bind address.
pub struct AddressSelector<S = SystemInterfaces> {
    source: S,
    ignored_bridges: Vec<String>,
    bind_address: Mutex<Option<IpAddr>>,
}

impl AddressSelector<SystemInterfaces> {
    /// Selector backed by the host's real interfaces.
    pub fn new() -> Self {
        Self::with_source(SystemInterfaces)
    }
}

impl Default for AddressSelector<SystemInterfaces> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: InterfaceSource> AddressSelector<S> {
    pub fn with_source(source: S) -> Self {
        Self {
            source,
            ignored_bridges: DEFAULT_IGNORED_BRIDGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bind_address: Mutex::new(None),
        }
    }

    /// Replace the set of bridge device names that are never considered.
    pub fn with_ignored_bridges(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignored_bridges = names.into_iter().collect();
        self
    }

    /// Pin the bind address, bypassing interface discovery entirely.
    pub fn set_bind_address_override(&self, ip: IpAddr) {
        let mut bind = self.bind_address.lock().expect("bind address lock");
        info!(address = %ip, "bind address overridden");
        *bind = Some(ip);
    }

    /// The memoized bind address, if one has been chosen yet.
    pub fn bind_address(&self) -> Option<IpAddr> {
        *self.bind_address.lock().expect("bind address lock")
    }

    /// Choose the bind address on first call; later calls return the
    /// same value without re-reading interfaces.
    ///
    /// Fails with [`ClusterError::NotFound`] when no eligible cloud-local
    /// address exists, leaving the selector untouched.
    pub fn ensure_bind_address(&self) -> ClusterResult<IpAddr> {
        let mut bind = self.bind_address.lock().expect("bind address lock");
        if let Some(ip) = *bind {
            return Ok(ip);
        }

        let interfaces = self.source.interfaces()?;
        let ip = self.select(&interfaces)?;
        info!(address = %ip, "selected cluster bind address");
        *bind = Some(ip);
        Ok(ip)
    }

    fn select(&self, interfaces: &[NetInterface]) -> ClusterResult<IpAddr> {
        let mut candidates: Vec<(String, IpAddr)> = Vec::new();

        for iface in interfaces {
            if iface.loopback || self.ignored_bridges.iter().any(|b| b == &iface.name) {
                debug!(interface = %iface.name, "skipping interface");
                continue;
            }
            for ip in &iface.addresses {
                if classify_ip(*ip) == Scope::CloudLocal {
                    candidates.push((ip.to_string(), *ip));
                }
            }
        }

        // Textual order keeps the choice stable across restarts without
        // persisting anything.
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates
            .first()
            .map(|(_, ip)| *ip)
            .ok_or_else(|| {
                ClusterError::NotFound("no cloud-local address on any usable interface".into())
            })
    }
}
