//! Local IPv4 networks and scan range expansion.

use crate::error::{LinkError, Result};
use ipnetwork::Ipv4Network;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::net::Ipv4Addr;

/// Ranges swept when no usable interface is found
pub const FALLBACK_RANGES: [&str; 3] = ["192.168.1.0/24", "192.168.0.0/24", "10.0.0.0/24"];

/// Shortest CIDR prefix accepted for an explicit range (65536 addresses)
pub const MIN_RANGE_PREFIX: u8 = 16;

/// One IPv4 address on a local interface, widened to its /24.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNetwork {
    pub interface: String,
    pub address: Ipv4Addr,
    pub network: Ipv4Network,
    /// Directed broadcast for the interface, from the OS when known
    pub broadcast: Ipv4Addr,
}

impl LocalNetwork {
    pub fn new(interface: impl Into<String>, address: Ipv4Addr, broadcast: Option<Ipv4Addr>) -> Self {
        let network = slash_24(address);
        Self {
            interface: interface.into(),
            address,
            network,
            broadcast: broadcast.unwrap_or_else(|| network.broadcast()),
        }
    }
}

fn slash_24(address: Ipv4Addr) -> Ipv4Network {
    let [a, b, c, _] = address.octets();
    // Prefix 24 is always valid.
    Ipv4Network::new(Ipv4Addr::new(a, b, c, 0), 24)
        .unwrap_or_else(|_| Ipv4Network::from(address))
}

/// Source of local networks. Swappable so scans can run against fixed data.
///
/// Implementations may block; scans call them on tokio's blocking pool.
pub trait InterfaceProvider: Send + Sync {
    fn local_networks(&self) -> Result<Vec<LocalNetwork>>;
}

/// Reads interfaces from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceProvider for SystemInterfaces {
    fn local_networks(&self) -> Result<Vec<LocalNetwork>> {
        let interfaces = NetworkInterface::show().map_err(|e| LinkError::Interface(e.to_string()))?;

        let mut networks: Vec<LocalNetwork> = Vec::new();
        for interface in interfaces {
            for addr in &interface.addr {
                let Addr::V4(v4) = addr else { continue };
                if !is_scannable(v4.ip) {
                    continue;
                }
                let local = LocalNetwork::new(interface.name.clone(), v4.ip, v4.broadcast);
                if networks.iter().any(|n| n.network == local.network) {
                    continue;
                }
                tracing::debug!(
                    "Interface {}: {} -> {}",
                    local.interface,
                    local.address,
                    local.network
                );
                networks.push(local);
            }
        }
        Ok(networks)
    }
}

fn is_scannable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local()
}

/// Host addresses of a network, skipping network/broadcast below /31.
pub fn hosts_of(network: Ipv4Network) -> Vec<Ipv4Addr> {
    if network.prefix() >= 31 {
        return network.iter().collect();
    }
    let first = network.network();
    let last = network.broadcast();
    network.iter().filter(|ip| *ip != first && *ip != last).collect()
}

/// Expand a user-supplied range: CIDR, single address or `a.b.c.x-y`.
pub fn parse_ip_range(range: &str) -> Result<Vec<Ipv4Addr>> {
    let range = range.trim();
    let invalid = || LinkError::InvalidAddress(range.to_string());

    if range.contains('/') {
        let network: Ipv4Network = range.parse().map_err(|_| invalid())?;
        if network.prefix() < MIN_RANGE_PREFIX {
            return Err(LinkError::InvalidAddress(format!(
                "{} is wider than /{}",
                range, MIN_RANGE_PREFIX
            )));
        }
        return Ok(hosts_of(network));
    }

    if let Some((start, end)) = range.split_once('-') {
        let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid())?;
        let end: u8 = end.trim().parse().map_err(|_| invalid())?;
        let [a, b, c, first] = start.octets();
        if end < first {
            return Err(invalid());
        }
        return Ok((first..=end).map(|d| Ipv4Addr::new(a, b, c, d)).collect());
    }

    let single: Ipv4Addr = range.parse().map_err(|_| invalid())?;
    Ok(vec![single])
}

/// Concrete sweep targets plus a human-readable description of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTargets {
    pub hosts: Vec<Ipv4Addr>,
    pub description: String,
}

/// Resolve what to sweep: the explicit range if given, else every local /24,
/// else the fallback private ranges.
pub fn resolve_targets(ip_range: Option<&str>, locals: &[LocalNetwork]) -> Result<ScanTargets> {
    if let Some(range) = ip_range.filter(|r| !r.trim().is_empty()) {
        return Ok(ScanTargets {
            hosts: parse_ip_range(range)?,
            description: range.trim().to_string(),
        });
    }

    let networks: Vec<(Ipv4Network, String)> = if locals.is_empty() {
        tracing::warn!("No usable IPv4 interfaces, falling back to common private ranges");
        FALLBACK_RANGES
            .iter()
            .filter_map(|r| r.parse().ok())
            .map(|n: Ipv4Network| (n, n.to_string()))
            .collect()
    } else {
        locals
            .iter()
            .map(|l| (l.network, format!("{} ({})", l.network, l.interface)))
            .collect()
    };

    let mut hosts = Vec::new();
    for (network, _) in &networks {
        for host in hosts_of(*network) {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
    }

    Ok(ScanTargets {
        hosts,
        description: networks
            .into_iter()
            .map(|(_, d)| d)
            .collect::<Vec<_>>()
            .join(", "),
    })
}
