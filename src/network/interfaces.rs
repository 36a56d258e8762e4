//! Local IPv4 interface snapshots
//!
//! Interfaces are listed fresh every time they are needed; nothing here
//! caches them, so an address change is picked up on the next beacon or
//! handshake.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

use crate::error::NetworkError;

/// One local IPv4 address with its network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    /// Network address and prefix, e.g. 192.168.1.0/24
    pub network: Ipv4Network,
}

impl NetworkInterface {
    /// Build from an address and netmask, deriving network and broadcast
    pub fn new(name: impl Into<String>, ip: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, NetworkError> {
        let with_host = Ipv4Network::with_netmask(ip, netmask)
            .map_err(|e| NetworkError::Interfaces(format!("{}/{}: {}", ip, netmask, e)))?;
        let network = Ipv4Network::new(with_host.network(), with_host.prefix())
            .map_err(|e| NetworkError::Interfaces(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            ip,
            netmask,
            broadcast: network.broadcast(),
            network,
        })
    }

    /// Whether `ip` falls inside this interface's network
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network.contains(ip)
    }

    /// Network in CIDR notation, as advertised in beacons
    pub fn cidr(&self) -> String {
        self.network.to_string()
    }
}

/// Source of local interface snapshots
pub trait InterfaceLister: Send + Sync {
    fn interfaces(&self) -> Result<Vec<NetworkInterface>, NetworkError>;
}

/// Lists the host's interfaces through the OS
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceLister for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<NetworkInterface>, NetworkError> {
        let addrs = if_addrs::get_if_addrs().map_err(|e| NetworkError::Interfaces(e.to_string()))?;

        let mut interfaces = Vec::new();
        for iface in addrs {
            if let if_addrs::IfAddr::V4(v4) = &iface.addr {
                match NetworkInterface::new(iface.name.clone(), v4.ip, v4.netmask) {
                    Ok(mut ni) => {
                        if let Some(broadcast) = v4.broadcast {
                            ni.broadcast = broadcast;
                        }
                        interfaces.push(ni);
                    }
                    Err(e) => {
                        tracing::debug!("Skipping interface {}: {}", iface.name, e);
                    }
                }
            }
        }
        Ok(interfaces)
    }
}

/// Fixed interface list, for hosts with a known topology and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<NetworkInterface>);

impl InterfaceLister for StaticInterfaces {
    fn interfaces(&self) -> Result<Vec<NetworkInterface>, NetworkError> {
        Ok(self.0.clone())
    }
}

/// Pick the local address used to reach `peer_ip`
///
/// First interface whose network contains the peer wins; otherwise the
/// first non-loopback address; otherwise loopback.
pub fn select_local_ip(peer_ip: Ipv4Addr, interfaces: &[NetworkInterface]) -> Ipv4Addr {
    interfaces
        .iter()
        .find(|iface| iface.contains(peer_ip))
        .or_else(|| interfaces.iter().find(|iface| !iface.ip.is_loopback()))
        .map(|iface| iface.ip)
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Same as [`select_local_ip`], listing interfaces through `lister`
///
/// A listing failure is treated as an empty list.
pub fn select_local_ip_with(peer_ip: Ipv4Addr, lister: &dyn InterfaceLister) -> Ipv4Addr {
    match lister.interfaces() {
        Ok(interfaces) => select_local_ip(peer_ip, &interfaces),
        Err(e) => {
            tracing::warn!("Interface listing failed, falling back to loopback: {}", e);
            Ipv4Addr::LOCALHOST
        }
    }
}

/// First advertised network that is also one of ours
pub fn shared_network(advertised: &[String], interfaces: &[NetworkInterface]) -> Option<String> {
    advertised
        .iter()
        .find(|net| interfaces.iter().any(|iface| &iface.cidr() == *net))
        .cloned()
}
