use crate::buffer::Buffer;
use crate::dns::DnsResolver;
use crate::error::{ProxyError, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Transport carried to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl Address {
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::V4(ip) => Some(IpAddr::V4(*ip)),
            Address::V6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Address::V4(ip),
            IpAddr::V6(ip) => Address::V6(ip),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip) => write!(f, "{}", ip),
            Address::V6(ip) => write!(f, "[{}]", ip),
            Address::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

/// Where a unit of traffic is headed. Built once when the inbound protocol
/// parses its request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    network: Network,
    address: Address,
    port: u16,
}

impl Destination {
    pub fn new(network: Network, address: Address, port: u16) -> Self {
        Self {
            network,
            address,
            port,
        }
    }

    pub fn tcp(address: Address, port: u16) -> Self {
        Self::new(Network::Tcp, address, port)
    }

    pub fn udp(address: Address, port: u16) -> Self {
        Self::new(Network::Udp, address, port)
    }

    pub fn from_socket_addr(network: Network, addr: SocketAddr) -> Self {
        Self::new(network, addr.ip().into(), addr.port())
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tcp(&self) -> bool {
        self.network == Network::Tcp
    }

    pub fn is_udp(&self) -> bool {
        self.network == Network::Udp
    }

    /// Socket address for IP destinations; domains need [`Destination::resolve`].
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.address
            .ip()
            .map(|ip| SocketAddr::new(ip, self.port))
            .ok_or_else(|| {
                ProxyError::DnsResolution(format!("{} needs async resolution", self.address))
            })
    }

    pub async fn resolve(&self, resolver: &DnsResolver) -> Result<SocketAddr> {
        match &self.address {
            Address::Domain(domain) => resolver.resolve_domain(domain, self.port).await,
            _ => self.socket_addr(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.network, self.address, self.port)
    }
}

/// A destination plus an owned payload.
///
/// For UDP every packet is self-contained. For TCP consecutive payloads form
/// a stream and `more_chunks` tells whether further data follows.
#[derive(Debug)]
pub struct Packet {
    destination: Destination,
    payload: Buffer,
    more_chunks: bool,
}

impl Packet {
    pub fn new(destination: Destination, payload: Buffer, more_chunks: bool) -> Self {
        Self {
            destination,
            payload,
            more_chunks,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn payload(&self) -> &Buffer {
        &self.payload
    }

    pub fn more_chunks(&self) -> bool {
        self.more_chunks
    }

    pub fn into_parts(self) -> (Destination, Buffer) {
        (self.destination, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_display() {
        let dest = Destination::tcp(Address::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        assert_eq!(dest.to_string(), "tcp:127.0.0.1:8080");
        let dest = Destination::udp(Address::V6(Ipv6Addr::LOCALHOST), 53);
        assert_eq!(dest.to_string(), "udp:[::1]:53");
        let dest = Destination::tcp(Address::Domain("example.com".into()), 443);
        assert_eq!(dest.to_string(), "tcp:example.com:443");
    }

    #[test]
    fn test_socket_addr_requires_ip() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let dest = Destination::from_socket_addr(Network::Udp, addr);
        assert!(dest.is_udp());
        assert_eq!(dest.socket_addr().unwrap(), addr);

        let dest = Destination::tcp(Address::Domain("example.com".into()), 80);
        assert!(matches!(dest.socket_addr(), Err(ProxyError::DnsResolution(_))));
    }

    #[test]
    fn test_network_distinguishes_destinations() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        assert_ne!(
            Destination::from_socket_addr(Network::Tcp, addr),
            Destination::from_socket_addr(Network::Udp, addr)
        );
    }
}
