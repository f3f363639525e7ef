//! SOCKS5 server serving CONNECT and UDP ASSOCIATE through the connector
//! chain

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use log::{debug, error, trace, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};

use crate::{
    connect::{Network, SharedConnector},
    relay::{
        socks5::{
            self, Address, Command, Error as Socks5Error, HandshakeRequest, HandshakeResponse, Reply,
            TcpRequestHeader, TcpResponseHeader,
        },
        TimeoutConn, Transporter, CONNECT_TIMEOUT, TCP_IO_TIMEOUT,
    },
};

mod udprelay;

/// SOCKS5 service over a connector chain
pub struct Socks5Server {
    tcp_connector: SharedConnector,
    udp_connector: SharedConnector,
    transporter: Transporter,
}

impl Socks5Server {
    pub fn new(tcp_connector: SharedConnector, udp_connector: SharedConnector) -> Socks5Server {
        Socks5Server {
            tcp_connector,
            udp_connector,
            transporter: Transporter::new(),
        }
    }

    /// Accept loop; one task per client connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            trace!("accepted {}", peer_addr);

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_client(stream, peer_addr).await {
                    error!("client {} failed: {}", peer_addr, err);
                }
            });
        }
    }

    async fn handle_client(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let handshake = match HandshakeRequest::read_from(&mut stream).await {
            Ok(r) => r,
            Err(Socks5Error::Io(ref err)) if err.kind() == ErrorKind::UnexpectedEof => {
                trace!("handshake early eof, peer {}", peer_addr);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if !handshake.methods.contains(&socks5::SOCKS5_AUTH_METHOD_NONE) {
            HandshakeResponse::new(socks5::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE)
                .write_to(&mut stream)
                .await?;
            return Err(Socks5Error::NoAcceptableAuthMethod.into());
        }
        HandshakeResponse::new(socks5::SOCKS5_AUTH_METHOD_NONE)
            .write_to(&mut stream)
            .await?;

        let request = match TcpRequestHeader::read_from(&mut stream).await {
            Ok(r) => r,
            Err(err) => {
                let response = TcpResponseHeader::new(err.as_reply(), dummy_address());
                response.write_to(&mut stream).await?;
                return Err(err.into());
            }
        };

        match request.command {
            Command::TcpConnect => {
                debug!("CONNECT {} from {}", request.address, peer_addr);
                self.handle_connect(stream, request.address).await
            }
            Command::UdpAssociate => {
                debug!("UDP ASSOCIATE {} from {}", request.address, peer_addr);
                udprelay::handle_udp_associate(
                    stream,
                    request.address,
                    self.udp_connector.clone(),
                    self.transporter.clone(),
                )
                .await
            }
            Command::TcpBind => {
                warn!("BIND is not supported, peer {}", peer_addr);
                let response = TcpResponseHeader::new(Reply::CommandNotSupported, request.address);
                response.write_to(&mut stream).await?;
                Err(io::Error::new(ErrorKind::Unsupported, "unsupported command BIND"))
            }
        }
    }

    async fn handle_connect(&self, mut stream: TcpStream, target: Address) -> io::Result<()> {
        let dial = time::timeout(CONNECT_TIMEOUT, self.tcp_connector.dial(Network::Tcp, &target));
        let remote = match dial.await {
            Ok(Ok(remote)) => remote,
            result => {
                let err = match result {
                    Ok(Err(err)) => err,
                    _ => io::Error::new(ErrorKind::TimedOut, "connect timed out"),
                };
                let response = TcpResponseHeader::new(Reply::HostUnreachable, dummy_address());
                response.write_to(&mut stream).await?;
                return Err(err);
            }
        };

        let response = TcpResponseHeader::new(Reply::Succeeded, Address::SocketAddress(stream.local_addr()?));
        response.write_to(&mut stream).await?;

        let local = TimeoutConn::new(stream, TCP_IO_TIMEOUT);
        let remote = TimeoutConn::new(remote, TCP_IO_TIMEOUT);
        self.transporter.transport(local, remote).await
    }
}

fn dummy_address() -> Address {
    Address::SocketAddress(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
}
