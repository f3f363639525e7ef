//! SOCKS5 UDP ASSOCIATE connector
//!
//! A UDP association is a pair of connections: the TCP control connection
//! the ASSOCIATE request was sent on and the UDP socket talking to the relay
//! endpoint the proxy returned. RFC 1928 ties their lifetimes together, so
//! the returned wrapper owns both and tears down the pair when either side
//! terminates.

use std::{
    future::Future,
    io::{self, ErrorKind},
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    sync::oneshot,
    task::JoinHandle,
    time,
};

use crate::{
    config::SocksAddr,
    relay::{
        socks5::{Address, Command, Reply, TcpRequestHeader, TcpResponseHeader, UdpAssociateHeader},
        CONNECT_TIMEOUT, MAXIMUM_UDP_PAYLOAD_SIZE,
    },
};

use super::{socks5::negotiate_method, unsupported_network, BoxedConn, Connector, Network, SharedConnector};

/// Dials UDP through one SOCKS5 proxy. The proxy's control connection is
/// reached via `tcp_inner`, the relay endpoint via `udp_inner`, so chains
/// tunnel each hop through the hops below it.
pub struct Socks5UdpConnector {
    tcp_inner: SharedConnector,
    udp_inner: SharedConnector,
    proxy: SocksAddr,
}

impl Socks5UdpConnector {
    pub fn new(tcp_inner: SharedConnector, udp_inner: SharedConnector, proxy: SocksAddr) -> Socks5UdpConnector {
        Socks5UdpConnector {
            tcp_inner,
            udp_inner,
            proxy,
        }
    }
}

#[async_trait]
impl Connector for Socks5UdpConnector {
    async fn dial(&self, network: Network, addr: &Address) -> io::Result<BoxedConn> {
        if network != Network::Udp {
            return Err(unsupported_network(network));
        }

        let mut control = self.tcp_inner.dial(Network::Tcp, &self.proxy.addr).await?;

        let relay_addr = time::timeout(
            CONNECT_TIMEOUT,
            associate_request(&mut control, &self.proxy, addr),
        )
        .await
        .map_err(|_| io::Error::new(ErrorKind::TimedOut, "socks5 negotiation timed out"))??;

        debug!("udp associate for {} relayed via {}", addr, relay_addr);

        let relay = self.udp_inner.dial(Network::Udp, &relay_addr).await?;
        let guard = AssociationGuard::spawn(control);

        // An unspecified destination means the caller relays datagrams it
        // has already framed itself; otherwise frame every write for `addr`.
        let raw = match *addr {
            Address::SocketAddress(sa) => sa.ip().is_unspecified(),
            Address::DomainNameAddress(..) => false,
        };
        if raw {
            Ok(Box::new(RawAssociation { relay, guard }))
        } else {
            Ok(Box::new(FramedAssociation {
                relay,
                guard,
                target: addr.clone(),
                recv_buf: vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE].into_boxed_slice(),
            }))
        }
    }
}

async fn associate_request(control: &mut BoxedConn, proxy: &SocksAddr, target: &Address) -> io::Result<Address> {
    negotiate_method(control, &proxy.auth).await?;

    // the request carries a zero address of the target's family; the reply
    // holds the relay endpoint datagrams must be sent to
    let request = TcpRequestHeader::new(Command::UdpAssociate, target.unspecified_of_same_family());
    request.write_to(control).await?;

    let response = TcpResponseHeader::read_from(control).await.map_err(io::Error::from)?;
    trace!("socks5 UDP ASSOCIATE for {} reply {}", target, response.reply);

    match response.reply {
        Reply::Succeeded => Ok(response.address),
        reply => Err(io::Error::new(
            ErrorKind::ConnectionAborted,
            format!("destination unreachable: {target} ({reply})"),
        )),
    }
}

/// Owns the control connection through a background task that drains it
/// until EOF. Control termination aborts the association; dropping the
/// association aborts the drain task, closing the control connection.
#[derive(Debug)]
struct AssociationGuard {
    drain: JoinHandle<()>,
    terminated: oneshot::Receiver<()>,
    done: bool,
}

impl AssociationGuard {
    fn spawn(mut control: BoxedConn) -> AssociationGuard {
        let (tx, rx) = oneshot::channel();
        let drain = tokio::spawn(async move {
            let mut scrap = [0u8; 2048];
            loop {
                match control.read(&mut scrap).await {
                    Ok(0) | Err(..) => break,
                    Ok(..) => continue,
                }
            }
            let _ = tx.send(());
        });
        AssociationGuard {
            drain,
            terminated: rx,
            done: false,
        }
    }

    /// Ready once the control connection has terminated
    fn poll_terminated(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.done {
            return Poll::Ready(());
        }
        match Pin::new(&mut self.terminated).poll(cx) {
            Poll::Ready(..) => {
                self.done = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AssociationGuard {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

fn association_closed() -> io::Error {
    io::Error::new(ErrorKind::ConnectionAborted, "udp association control connection closed")
}

/// Association passing datagrams through verbatim; the caller frames them
#[derive(Debug)]
struct RawAssociation {
    relay: BoxedConn,
    guard: AssociationGuard,
}

impl AsyncRead for RawAssociation {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.guard.poll_terminated(cx).is_ready() {
            return Poll::Ready(Err(association_closed()));
        }
        Pin::new(&mut this.relay).poll_read(cx, buf)
    }
}

impl AsyncWrite for RawAssociation {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.guard.poll_terminated(cx).is_ready() {
            return Poll::Ready(Err(association_closed()));
        }
        Pin::new(&mut this.relay).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().relay).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().relay).poll_shutdown(cx)
    }
}

/// Association framing every datagram for a fixed destination: writes
/// prepend the SOCKS5 UDP header, reads strip and validate it
#[derive(Debug)]
struct FramedAssociation {
    relay: BoxedConn,
    guard: AssociationGuard,
    target: Address,
    recv_buf: Box<[u8]>,
}

impl AsyncRead for FramedAssociation {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.guard.poll_terminated(cx).is_ready() {
            return Poll::Ready(Err(association_closed()));
        }

        let mut datagram = ReadBuf::new(&mut this.recv_buf);
        match Pin::new(&mut this.relay).poll_read(cx, &mut datagram) {
            Poll::Ready(Ok(())) => {
                let datagram = datagram.filled();
                let (header, header_len) = match UdpAssociateHeader::parse_from(datagram) {
                    Ok(parsed) => parsed,
                    Err(err) => return Poll::Ready(Err(err.into())),
                };
                if header.frag != 0 {
                    return Poll::Ready(Err(io::Error::new(
                        ErrorKind::InvalidData,
                        "fragmented UDP datagrams are not supported",
                    )));
                }
                trace!("udp datagram from {}, {} bytes", header.address, datagram.len() - header_len);

                let payload = &datagram[header_len..];
                let n = payload.len().min(buf.remaining());
                buf.put_slice(&payload[..n]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for FramedAssociation {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.guard.poll_terminated(cx).is_ready() {
            return Poll::Ready(Err(association_closed()));
        }

        let header = UdpAssociateHeader::new(0, this.target.clone());
        let mut datagram = BytesMut::with_capacity(header.serialized_len() + buf.len());
        header.write_to_buf(&mut datagram);
        datagram.extend_from_slice(buf);

        match Pin::new(&mut this.relay).poll_write(cx, &datagram) {
            Poll::Ready(Ok(n)) => Poll::Ready(Ok(n.saturating_sub(header.serialized_len()))),
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().relay).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().relay).poll_shutdown(cx)
    }
}
