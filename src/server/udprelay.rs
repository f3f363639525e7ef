//! UDP ASSOCIATE service
//!
//! The association binds a fresh UDP socket next to the accepted TCP
//! connection and announces it in the reply. The source of the first
//! datagram pins the client endpoint for the association's lifetime; any
//! datagram from another endpoint fails the relay. Client datagrams are
//! already SOCKS5-framed, so the upstream association is dialed with an
//! unspecified target and relays them verbatim.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use log::debug;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpStream, UdpSocket},
    time,
};

use crate::{
    connect::{Network, SharedConnector},
    relay::{
        socks5::{Address, Reply, TcpResponseHeader},
        TimeoutConn, Transporter, CONNECT_TIMEOUT, MAXIMUM_UDP_PAYLOAD_SIZE, UDP_IO_TIMEOUT,
    },
};

pub(crate) async fn handle_udp_associate(
    mut stream: TcpStream,
    client_addr: Address,
    udp_connector: SharedConnector,
    transporter: Transporter,
) -> io::Result<()> {
    // bind on the host the client reached us on, any port
    let bind_addr = SocketAddr::new(stream.local_addr()?.ip(), 0);
    let socket = UdpSocket::bind(bind_addr).await?;
    let bound_addr = socket.local_addr()?;

    let response = TcpResponseHeader::new(Reply::Succeeded, Address::SocketAddress(bound_addr));
    response.write_to(&mut stream).await?;
    debug!("udp associate bound on {}", bound_addr);

    // the first datagram pins the client endpoint
    let mut first = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
    let (n, client) = socket.recv_from(&mut first).await?;
    debug!("udp associate client pinned to {}", client);

    let target = client_addr.unspecified_of_same_family();
    let upstream = time::timeout(CONNECT_TIMEOUT, udp_connector.dial(Network::Udp, &target))
        .await
        .map_err(|_| io::Error::new(ErrorKind::TimedOut, "connect timed out"))??;

    let mut upstream = TimeoutConn::new(upstream, UDP_IO_TIMEOUT);
    upstream.write_all(&first[..n]).await?;
    drop(first);

    let local = TimeoutConn::new(PinnedUdpSocket { socket, client }, UDP_IO_TIMEOUT);
    transporter.transport(local, upstream).await
}

/// UDP socket accepting datagrams only from the pinned client endpoint and
/// sending every write back to it
struct PinnedUdpSocket {
    socket: UdpSocket,
    client: SocketAddr,
}

impl AsyncRead for PinnedUdpSocket {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.socket.poll_recv_from(cx, buf) {
            Poll::Ready(Ok(from)) => {
                if from != this.client {
                    return Poll::Ready(Err(io::Error::new(
                        ErrorKind::InvalidData,
                        format!("datagram from unexpected source {from}"),
                    )));
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for PinnedUdpSocket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.socket.poll_send_to(cx, buf, this.client)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn pinned_socket_rejects_other_sources() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bound = socket.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut pinned = PinnedUdpSocket {
            socket,
            client: client.local_addr().unwrap(),
        };

        client.send_to(b"hello", bound).await.unwrap();
        let mut buf = [0u8; 16];
        let n = pinned.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        stranger.send_to(b"intruder", bound).await.unwrap();
        let err = pinned.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
