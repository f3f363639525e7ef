//! Composable outbound connectors
//!
//! A [`Connector`] dials a destination and hands back an owned duplex
//! connection. Higher layers wrap inner connectors to add SOCKS5 hops,
//! round-robin rotation or local NAT redirects, forming the chain that both
//! the SOCKS5 server and the network stack dial through.

use std::{
    fmt::{self, Display, Formatter},
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{lookup_host, TcpStream, UdpSocket},
};

use crate::{config::SocksAddr, relay::socks5::Address};

pub mod nat;
pub mod rotation;
pub mod socks5;
pub mod socks5_udp;

pub use self::{
    nat::{AddressMapper, NatConnector},
    rotation::RotationConnector,
    socks5::Socks5Connector,
    socks5_udp::Socks5UdpConnector,
};

/// Transport selector for a dial
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Network {
    type Err = ();

    fn from_str(s: &str) -> Result<Network, ()> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            _ => Err(()),
        }
    }
}

/// An established duplex byte stream or datagram channel
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug + ?Sized> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

pub type SharedConnector = Arc<dyn Connector>;

/// Dials a destination over the given network.
///
/// On success the caller owns the returned connection and is responsible for
/// closing it (dropping it). On failure no sockets are leaked.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, network: Network, addr: &Address) -> io::Result<BoxedConn>;
}

pub(crate) fn unsupported_network(network: Network) -> io::Error {
    io::Error::new(ErrorKind::Unsupported, format!("network {network} is not supported"))
}

/// Dials with OS facilities, no proxying
pub struct DirectConnector(());

impl DirectConnector {
    pub fn new() -> DirectConnector {
        DirectConnector(())
    }
}

impl Default for DirectConnector {
    fn default() -> DirectConnector {
        DirectConnector::new()
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn dial(&self, network: Network, addr: &Address) -> io::Result<BoxedConn> {
        let target = resolve(addr).await?;
        match network {
            Network::Tcp => {
                let stream = TcpStream::connect(target).await?;
                Ok(Box::new(stream))
            }
            Network::Udp => {
                let bind_addr: SocketAddr = match target {
                    SocketAddr::V4(..) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(..) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                let socket = UdpSocket::bind(bind_addr).await?;
                socket.connect(target).await?;
                Ok(Box::new(UdpConn { socket }))
            }
        }
    }
}

async fn resolve(addr: &Address) -> io::Result<SocketAddr> {
    match *addr {
        Address::SocketAddress(sa) => Ok(sa),
        Address::DomainNameAddress(ref domain, port) => {
            lookup_host((domain.as_str(), port)).await?.next().ok_or_else(|| {
                io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("no addresses resolved for {domain}:{port}"),
                )
            })
        }
    }
}

/// A connected UDP socket exposed as a duplex channel: every read receives
/// one datagram, every write sends one
#[derive(Debug)]
struct UdpConn {
    socket: UdpSocket,
}

impl AsyncRead for UdpConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Builds the transparent-mode connector chain.
///
/// TCP nests cumulatively: reaching proxy `k` tunnels through proxy `k-1`.
/// The UDP chain associates with proxy `k` over the TCP chain up to `k-1`
/// while relaying datagrams through the UDP chain below it. Both chains are
/// finally wrapped with the NAT redirect table.
pub fn compose_transparent(proxies: &[SocksAddr], mapper: Arc<AddressMapper>) -> (SharedConnector, SharedConnector) {
    let direct: SharedConnector = Arc::new(DirectConnector::new());

    let mut tcp_chain: Vec<SharedConnector> = Vec::with_capacity(proxies.len() + 1);
    tcp_chain.push(direct.clone());
    let mut tcp = direct.clone();
    for proxy in proxies {
        tcp = Arc::new(Socks5Connector::new(tcp.clone(), proxy.clone()));
        tcp_chain.push(tcp.clone());
    }

    let mut udp = direct.clone();
    for (i, proxy) in proxies.iter().enumerate() {
        udp = Arc::new(Socks5UdpConnector::new(tcp_chain[i].clone(), udp.clone(), proxy.clone()));
    }

    let tcp = Arc::new(NatConnector::new(direct.clone(), tcp, mapper.clone()));
    let udp = Arc::new(NatConnector::new(direct, udp, mapper));
    (tcp, udp)
}

/// Builds the server-mode rotation: one single-hop SOCKS5 connector per
/// proxy, fanned out round-robin
pub fn compose_rotation(proxies: &[SocksAddr]) -> (SharedConnector, SharedConnector) {
    let direct: SharedConnector = Arc::new(DirectConnector::new());

    let mut tcp_proxies: Vec<SharedConnector> = Vec::with_capacity(proxies.len());
    let mut udp_proxies: Vec<SharedConnector> = Vec::with_capacity(proxies.len());
    for proxy in proxies {
        tcp_proxies.push(Arc::new(Socks5Connector::new(direct.clone(), proxy.clone())));
        udp_proxies.push(Arc::new(Socks5UdpConnector::new(
            direct.clone(),
            direct.clone(),
            proxy.clone(),
        )));
    }

    (
        Arc::new(RotationConnector::new(tcp_proxies)),
        Arc::new(RotationConnector::new(udp_proxies)),
    )
}
