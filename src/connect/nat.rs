//! Local NAT redirect table and the connector dispatching on it

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use log::debug;

use crate::relay::socks5::Address;

use super::{BoxedConn, Connector, Network, SharedConnector};

/// NAT table keyed by network, then by either a full `host:port` or a bare
/// port. Lookups try the full address first and fall back to the port, so a
/// bare-port entry matches every destination host on that port.
///
/// Reads are concurrent, insertions exclusive.
pub struct AddressMapper {
    tables: RwLock<HashMap<Network, HashMap<String, Address>>>,
}

impl AddressMapper {
    pub fn new() -> AddressMapper {
        AddressMapper {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a redirect of `from_addr` (`host:port`, `:port` or `port`) to
    /// `target`. An empty or `0.0.0.0` host stores the bare-port form.
    pub fn insert(&self, network: Network, from_addr: &str, target: Address) -> io::Result<()> {
        let from_addr = if from_addr.contains(':') {
            from_addr.to_owned()
        } else {
            format!(":{from_addr}")
        };

        let (host, port) = split_host_port(&from_addr)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("invalid address {from_addr}")))?;
        if port.parse::<u16>().is_err() {
            return Err(io::Error::new(ErrorKind::InvalidInput, format!("invalid port {port}")));
        }

        let key = if host.is_empty() || host == "0.0.0.0" {
            port.to_owned()
        } else {
            from_addr
        };

        let mut tables = self.tables.write().unwrap();
        tables.entry(network).or_default().insert(key, target);
        Ok(())
    }

    /// Looks up `addr` (`host:port`), falling back to its bare port
    pub fn lookup(&self, network: Network, addr: &str) -> Option<Address> {
        let tables = self.tables.read().unwrap();
        let table = tables.get(&network)?;
        if let Some(target) = table.get(addr) {
            return Some(target.clone());
        }
        let port = &addr[addr.rfind(':')? + 1..];
        table.get(port).cloned()
    }
}

impl Default for AddressMapper {
    fn default() -> AddressMapper {
        AddressMapper::new()
    }
}

/// Splits `host:port`, unwrapping a bracketed IPv6 host
fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let idx = addr.rfind(':')?;
    let (host, port) = (&addr[..idx], &addr[idx + 1..]);
    if let Some(inner) = host.strip_prefix('[') {
        let inner = inner.strip_suffix(']')?;
        Some((inner, port))
    } else if host.contains(':') {
        // an unbracketed colon means the last ":" was part of an IPv6
        // address, not a port separator
        None
    } else {
        Some((host, port))
    }
}

/// Routes a dial either directly to a NAT-mapped target or down the SOCKS
/// chain when no redirect matches
pub struct NatConnector {
    direct: SharedConnector,
    proxied: SharedConnector,
    mapper: Arc<AddressMapper>,
}

impl NatConnector {
    pub fn new(direct: SharedConnector, proxied: SharedConnector, mapper: Arc<AddressMapper>) -> NatConnector {
        NatConnector {
            direct,
            proxied,
            mapper,
        }
    }
}

#[async_trait]
impl Connector for NatConnector {
    async fn dial(&self, network: Network, addr: &Address) -> io::Result<BoxedConn> {
        if let Some(target) = self.mapper.lookup(network, &addr.to_string()) {
            debug!("nat redirect {network} {addr} -> {target}");
            return self.direct.dial(network, &target).await;
        }
        self.proxied.dial(network, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(addr: &str) -> Address {
        Address::SocketAddress(addr.parse().unwrap())
    }

    #[test]
    fn empty_mapper_misses() {
        let m = AddressMapper::new();
        assert_eq!(m.lookup(Network::Tcp, "1.1.1.1:53"), None);
    }

    #[test]
    fn full_address_mapped() {
        let m = AddressMapper::new();
        m.insert(Network::Tcp, "1.1.1.1:53", target("127.0.0.1:5353")).unwrap();

        assert_eq!(m.lookup(Network::Tcp, "1.1.1.1:53"), Some(target("127.0.0.1:5353")));
        assert_eq!(m.lookup(Network::Tcp, "2.2.2.2:53"), None);
    }

    #[test]
    fn two_full_addresses_mapped() {
        let m = AddressMapper::new();
        m.insert(Network::Tcp, "1.1.1.1:53", target("127.0.0.1:5353")).unwrap();
        m.insert(Network::Tcp, "8.8.8.8:1031", target("2.2.2.2:5454")).unwrap();

        assert_eq!(m.lookup(Network::Tcp, "1.1.1.1:53"), Some(target("127.0.0.1:5353")));
        assert_eq!(m.lookup(Network::Tcp, "8.8.8.8:1031"), Some(target("2.2.2.2:5454")));
    }

    #[test]
    fn networks_are_isolated() {
        let m = AddressMapper::new();
        m.insert(Network::Tcp, "1.1.1.1:53", target("127.0.0.1:5353")).unwrap();
        m.insert(Network::Udp, "1.1.1.1:53", target("2.2.2.2:5454")).unwrap();

        assert_eq!(m.lookup(Network::Tcp, "1.1.1.1:53"), Some(target("127.0.0.1:5353")));
        assert_eq!(m.lookup(Network::Udp, "1.1.1.1:53"), Some(target("2.2.2.2:5454")));
    }

    #[test]
    fn tcp_entry_invisible_to_udp() {
        let m = AddressMapper::new();
        m.insert(Network::Tcp, "1.1.1.1:53", target("127.0.0.1:5353")).unwrap();
        assert_eq!(m.lookup(Network::Udp, "1.1.1.1:53"), None);
    }

    #[test]
    fn bare_port_matches_any_host() {
        for from in ["53", ":53", "0.0.0.0:53"] {
            let m = AddressMapper::new();
            m.insert(Network::Tcp, from, target("127.0.0.1:5353")).unwrap();

            assert_eq!(m.lookup(Network::Tcp, "1.1.1.1:53"), Some(target("127.0.0.1:5353")));
            assert_eq!(m.lookup(Network::Tcp, "2.2.2.2:53"), Some(target("127.0.0.1:5353")));
        }
    }

    #[test]
    fn tcp_and_udp_ports_mapped() {
        let m = AddressMapper::new();
        m.insert(Network::Tcp, "53", target("127.0.0.1:5353")).unwrap();
        m.insert(Network::Udp, "53", target("1.2.3.4:5454")).unwrap();

        assert_eq!(m.lookup(Network::Tcp, "1.1.1.1:53"), Some(target("127.0.0.1:5353")));
        assert_eq!(m.lookup(Network::Udp, "2.2.2.2:53"), Some(target("1.2.3.4:5454")));
    }

    #[test]
    fn invalid_addresses_rejected() {
        let m = AddressMapper::new();
        assert!(m.insert(Network::Tcp, "1.1.1.1:53:53", target("127.0.0.1:5353")).is_err());
        assert!(m.insert(Network::Tcp, "1.1.1.1:abc", target("127.0.0.1:5353")).is_err());
        assert!(m.insert(Network::Tcp, "abc", target("127.0.0.1:5353")).is_err());
    }

    #[test]
    fn bracketed_ipv6_address_mapped() {
        let m = AddressMapper::new();
        m.insert(Network::Tcp, "[2001:db8::2:1]:53", target("127.0.0.1:5353")).unwrap();

        assert_eq!(
            m.lookup(Network::Tcp, "[2001:db8::2:1]:53"),
            Some(target("127.0.0.1:5353"))
        );
    }
}
