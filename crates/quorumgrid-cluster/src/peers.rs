//! Peer set resolution.
//!
//! Turns the API addresses of every controller into the join list handed
//! to the database engine: cloud-local hosts only, never ourselves, with
//! the API port swapped for the cluster port.

use std::collections::HashSet;
use std::net::IpAddr;

use quorum_core::{Scope, classify_host, join_host_port, split_host_port};
use tracing::{debug, warn};

/// Derives replication peers from controller API addresses.
#[derive(Debug, Clone, Copy)]
pub struct PeerSetResolver {
    cluster_port: u16,
}

impl PeerSetResolver {
    pub fn new(cluster_port: u16) -> Self {
        Self { cluster_port }
    }

    pub fn cluster_port(&self) -> u16 {
        self.cluster_port
    }

    /// Resolve the peer list for a node bound to `self_address`.
    ///
    /// Output keeps input order with duplicates removed. An empty result
    /// is the single-node bootstrap case, not an error.
    pub fn resolve(&self, self_address: &str, api_addresses: &[String]) -> Vec<String> {
        let self_ip = self_address.parse::<IpAddr>().ok().map(|ip| ip.to_canonical());
        let mut seen = HashSet::new();
        let mut peers = Vec::new();

        for addr in api_addresses {
            let host = match split_host_port(addr) {
                Ok((host, _)) => canonical_host(host),
                Err(e) => {
                    warn!(address = %addr, error = %e, "skipping malformed API address");
                    continue;
                }
            };

            let scope = classify_host(&host);
            if scope != Scope::CloudLocal {
                debug!(address = %addr, %scope, "skipping non cloud-local API address");
                continue;
            }

            if host == "localhost" || is_self(&host, self_address, self_ip) {
                continue;
            }

            let peer = join_host_port(&host, self.cluster_port);
            if peer == self_address {
                continue;
            }
            if seen.insert(peer.clone()) {
                peers.push(peer);
            }
        }

        debug!(count = peers.len(), "resolved cluster peers");
        peers
    }
}

/// IPv4-mapped IPv6 literals collapse to their IPv4 form so a node never
/// sees itself under a second spelling.
fn canonical_host(host: String) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.to_canonical().to_string(),
        Err(_) => host,
    }
}

fn is_self(host: &str, self_address: &str, self_ip: Option<IpAddr>) -> bool {
    match (host.parse::<IpAddr>().ok(), self_ip) {
        (Some(ip), Some(self_ip)) => ip == self_ip,
        _ => host == self_address,
    }
}

/// Convenience wrapper around [`PeerSetResolver::resolve`].
pub fn resolve_peers(self_address: &str, api_addresses: &[String], cluster_port: u16) -> Vec<String> {
    PeerSetResolver::new(cluster_port).resolve(self_address, api_addresses)
}
