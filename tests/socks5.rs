//! End-to-end tests against mock SOCKS5 upstreams on loopback

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};

use sockspin::{
    config::{Auth, SocksAddr},
    connect::{compose_rotation, Connector, DirectConnector, Network, Socks5Connector, Socks5UdpConnector},
    relay::socks5::{
        self, Address, Command, HandshakeRequest, HandshakeResponse, PasswdAuthRequest, PasswdAuthResponse, Reply,
        TcpRequestHeader, TcpResponseHeader, UdpAssociateHeader,
    },
    server::Socks5Server,
};

/// A tiny real SOCKS5 proxy: CONNECT dials out directly, UDP ASSOCIATE
/// relays datagrams between the client and their destinations
async fn spawn_mock_proxy(auth: Option<(&'static str, &'static str)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(..) => return,
            };
            tokio::spawn(async move {
                let _ = handle_mock_client(stream, auth).await;
            });
        }
    });
    addr
}

async fn handle_mock_client(mut stream: TcpStream, auth: Option<(&'static str, &'static str)>) -> io::Result<()> {
    let handshake = HandshakeRequest::read_from(&mut stream).await.map_err(io::Error::from)?;

    match auth {
        Some((username, password)) => {
            assert!(handshake.methods.contains(&socks5::SOCKS5_AUTH_METHOD_PASSWORD));
            HandshakeResponse::new(socks5::SOCKS5_AUTH_METHOD_PASSWORD)
                .write_to(&mut stream)
                .await?;

            let request = PasswdAuthRequest::read_from(&mut stream).await.map_err(io::Error::from)?;
            let accepted = request.username == username.as_bytes() && request.password == password.as_bytes();
            PasswdAuthResponse::new(if accepted { 0 } else { 1 })
                .write_to(&mut stream)
                .await?;
            if !accepted {
                return Ok(());
            }
        }
        None => {
            assert!(handshake.methods.contains(&socks5::SOCKS5_AUTH_METHOD_NONE));
            HandshakeResponse::new(socks5::SOCKS5_AUTH_METHOD_NONE)
                .write_to(&mut stream)
                .await?;
        }
    }

    let request = TcpRequestHeader::read_from(&mut stream).await.map_err(io::Error::from)?;
    match request.command {
        Command::TcpConnect => {
            let target = socket_addr_of(&request.address);
            match TcpStream::connect(target).await {
                Ok(mut remote) => {
                    let bound = Address::SocketAddress(remote.local_addr()?);
                    TcpResponseHeader::new(Reply::Succeeded, bound).write_to(&mut stream).await?;
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
                    Ok(())
                }
                Err(..) => {
                    TcpResponseHeader::new(Reply::HostUnreachable, unspecified_address())
                        .write_to(&mut stream)
                        .await?;
                    Ok(())
                }
            }
        }
        Command::UdpAssociate => serve_udp_associate(stream).await,
        Command::TcpBind => {
            TcpResponseHeader::new(Reply::CommandNotSupported, request.address)
                .write_to(&mut stream)
                .await?;
            Ok(())
        }
    }
}

async fn serve_udp_associate(mut control: TcpStream) -> io::Result<()> {
    let relay = UdpSocket::bind("127.0.0.1:0").await?;
    let relay_addr = relay.local_addr()?;
    TcpResponseHeader::new(Reply::Succeeded, Address::SocketAddress(relay_addr))
        .write_to(&mut control)
        .await?;

    let outbound = UdpSocket::bind("127.0.0.1:0").await?;
    let mut client: Option<SocketAddr> = None;
    let mut inbound_buf = vec![0u8; 65536];
    let mut outbound_buf = vec![0u8; 65536];
    let mut control_buf = [0u8; 64];

    loop {
        tokio::select! {
            received = relay.recv_from(&mut inbound_buf) => {
                let (n, from) = received?;
                let pinned = *client.get_or_insert(from);
                if from != pinned {
                    continue;
                }
                let (header, header_len) = UdpAssociateHeader::parse_from(&inbound_buf[..n]).map_err(io::Error::from)?;
                let target = socket_addr_of(&header.address);
                outbound.send_to(&inbound_buf[header_len..n], target).await?;
            }
            received = outbound.recv_from(&mut outbound_buf) => {
                let (n, from) = received?;
                if let Some(pinned) = client {
                    let header = UdpAssociateHeader::new(0, Address::SocketAddress(from));
                    let mut datagram = BytesMut::with_capacity(header.serialized_len() + n);
                    header.write_to_buf(&mut datagram);
                    datagram.extend_from_slice(&outbound_buf[..n]);
                    relay.send_to(&datagram, pinned).await?;
                }
            }
            // the association dies with the control connection
            received = control.read(&mut control_buf) => {
                match received {
                    Ok(0) | Err(..) => return Ok(()),
                    Ok(..) => {}
                }
            }
        }
    }
}

fn socket_addr_of(addr: &Address) -> SocketAddr {
    match *addr {
        Address::SocketAddress(sa) => sa,
        Address::DomainNameAddress(..) => panic!("unexpected domain address {addr} in test"),
    }
}

fn unspecified_address() -> Address {
    Address::SocketAddress(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
}

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(..) => return,
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let _ = socket.send_to(&buf[..n], from).await;
                }
                Err(..) => return,
            }
        }
    });
    addr
}

fn proxy(addr: SocketAddr) -> SocksAddr {
    SocksAddr {
        addr: Address::SocketAddress(addr),
        auth: None,
    }
}

#[tokio::test]
async fn socks5_connector_relays_tcp() {
    let echo_addr = spawn_tcp_echo().await;
    let proxy_addr = spawn_mock_proxy(None).await;

    let connector = Socks5Connector::new(Arc::new(DirectConnector::new()), proxy(proxy_addr));
    let mut conn = connector
        .dial(Network::Tcp, &Address::SocketAddress(echo_addr))
        .await
        .unwrap();

    conn.write_all(b"hello through socks5").await.unwrap();
    let mut buf = [0u8; 20];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through socks5");
}

#[tokio::test]
async fn socks5_connector_authenticates() {
    let echo_addr = spawn_tcp_echo().await;
    let proxy_addr = spawn_mock_proxy(Some(("user", "secret"))).await;

    let upstream = SocksAddr {
        addr: Address::SocketAddress(proxy_addr),
        auth: Some(Auth {
            username: "user".to_owned(),
            password: Some("secret".to_owned()),
        }),
    };
    let connector = Socks5Connector::new(Arc::new(DirectConnector::new()), upstream);
    let mut conn = connector
        .dial(Network::Tcp, &Address::SocketAddress(echo_addr))
        .await
        .unwrap();

    conn.write_all(b"auth ok").await.unwrap();
    let mut buf = [0u8; 7];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"auth ok");
}

#[tokio::test]
async fn socks5_connector_reports_unreachable_destination() {
    let proxy_addr = spawn_mock_proxy(None).await;

    // a freshly released port is a safe unreachable destination
    let unreachable = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let connector = Socks5Connector::new(Arc::new(DirectConnector::new()), proxy(proxy_addr));
    let err = connector
        .dial(Network::Tcp, &Address::SocketAddress(unreachable))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("destination unreachable"), "{err}");
}

#[tokio::test]
async fn socks5_connector_rejects_udp_network() {
    let proxy_addr = spawn_mock_proxy(None).await;
    let connector = Socks5Connector::new(Arc::new(DirectConnector::new()), proxy(proxy_addr));

    let err = connector
        .dial(Network::Udp, &Address::SocketAddress("127.0.0.1:53".parse().unwrap()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::Unsupported);
}

#[tokio::test]
async fn udp_connector_relays_datagrams() {
    let echo_addr = spawn_udp_echo().await;
    let proxy_addr = spawn_mock_proxy(None).await;

    let direct: Arc<DirectConnector> = Arc::new(DirectConnector::new());
    let connector = Socks5UdpConnector::new(direct.clone(), direct, proxy(proxy_addr));

    let mut conn = connector
        .dial(Network::Udp, &Address::SocketAddress(echo_addr))
        .await
        .unwrap();

    conn.write_all(b"udp ping").await.unwrap();
    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"udp ping");
}

#[tokio::test]
async fn server_mode_connect_round_trip() {
    let echo_addr = spawn_tcp_echo().await;
    let proxies = vec![proxy(spawn_mock_proxy(None).await), proxy(spawn_mock_proxy(None).await)];

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let (tcp_connector, udp_connector) = compose_rotation(&proxies);
    let server = Arc::new(Socks5Server::new(tcp_connector, udp_connector));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    // both rotation slots must work
    for _ in 0..2 {
        let mut stream = socks5_handshake(server_addr).await;
        TcpRequestHeader::new(Command::TcpConnect, Address::SocketAddress(echo_addr))
            .write_to(&mut stream)
            .await
            .unwrap();
        let response = TcpResponseHeader::read_from(&mut stream).await.unwrap();
        assert_eq!(response.reply, Reply::Succeeded);

        stream.write_all(b"rotated").await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"rotated");
    }
}

#[tokio::test]
async fn server_mode_rejects_bind() {
    let proxies = vec![proxy(spawn_mock_proxy(None).await)];

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let (tcp_connector, udp_connector) = compose_rotation(&proxies);
    let server = Arc::new(Socks5Server::new(tcp_connector, udp_connector));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let mut stream = socks5_handshake(server_addr).await;
    TcpRequestHeader::new(Command::TcpBind, unspecified_address())
        .write_to(&mut stream)
        .await
        .unwrap();
    let response = TcpResponseHeader::read_from(&mut stream).await.unwrap();
    assert_eq!(response.reply, Reply::CommandNotSupported);
}

#[tokio::test]
async fn server_mode_udp_associate_round_trip() {
    let echo_addr = spawn_udp_echo().await;
    let proxies = vec![proxy(spawn_mock_proxy(None).await)];

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let (tcp_connector, udp_connector) = compose_rotation(&proxies);
    let server = Arc::new(Socks5Server::new(tcp_connector, udp_connector));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let mut control = socks5_handshake(server_addr).await;
    TcpRequestHeader::new(Command::UdpAssociate, unspecified_address())
        .write_to(&mut control)
        .await
        .unwrap();
    let response = TcpResponseHeader::read_from(&mut control).await.unwrap();
    assert_eq!(response.reply, Reply::Succeeded);
    let relay_addr = socket_addr_of(&response.address);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let header = UdpAssociateHeader::new(0, Address::SocketAddress(echo_addr));
    let mut datagram = BytesMut::with_capacity(header.serialized_len() + 8);
    header.write_to_buf(&mut datagram);
    datagram.extend_from_slice(b"udp pong");
    client.send_to(&datagram, relay_addr).await.unwrap();

    let mut buf = vec![0u8; 65536];
    let (n, from) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(from, relay_addr);
    let (reply_header, header_len) = UdpAssociateHeader::parse_from(&buf[..n]).unwrap();
    assert_eq!(reply_header.frag, 0);
    assert_eq!(&buf[header_len..n], b"udp pong");
}

async fn socks5_handshake(server_addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(server_addr).await.unwrap();
    HandshakeRequest::new(vec![socks5::SOCKS5_AUTH_METHOD_NONE])
        .write_to(&mut stream)
        .await
        .unwrap();
    let response = HandshakeResponse::read_from(&mut stream).await.unwrap();
    assert_eq!(response.chosen_method, socks5::SOCKS5_AUTH_METHOD_NONE);
    stream
}
