//! SOCKS5 TCP CONNECT connector

use std::io::{self, ErrorKind};

use async_trait::async_trait;
use log::trace;
use tokio::time;

use crate::{
    config::{Auth, SocksAddr},
    relay::{
        socks5::{
            self, Address, Command, HandshakeRequest, HandshakeResponse, PasswdAuthRequest, PasswdAuthResponse,
            Reply, TcpRequestHeader, TcpResponseHeader,
        },
        CONNECT_TIMEOUT,
    },
};

use super::{unsupported_network, BoxedConn, Connector, Network, SharedConnector};

/// Dials through one SOCKS5 proxy, reaching the proxy itself via an inner
/// connector. Nesting these builds a tunnel-per-hop chain.
pub struct Socks5Connector {
    inner: SharedConnector,
    proxy: SocksAddr,
}

impl Socks5Connector {
    pub fn new(inner: SharedConnector, proxy: SocksAddr) -> Socks5Connector {
        Socks5Connector { inner, proxy }
    }
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn dial(&self, network: Network, addr: &Address) -> io::Result<BoxedConn> {
        if network != Network::Tcp {
            return Err(unsupported_network(network));
        }

        let mut stream = self.inner.dial(Network::Tcp, &self.proxy.addr).await?;

        // the whole negotiation runs under the connect deadline; the stream
        // is dropped (closed) on failure
        time::timeout(CONNECT_TIMEOUT, connect_request(&mut stream, &self.proxy.auth, addr))
            .await
            .map_err(|_| io::Error::new(ErrorKind::TimedOut, "socks5 negotiation timed out"))??;

        Ok(stream)
    }
}

async fn connect_request(stream: &mut BoxedConn, auth: &Option<Auth>, target: &Address) -> io::Result<()> {
    negotiate_method(stream, auth).await?;

    TcpRequestHeader::new(Command::TcpConnect, target.clone())
        .write_to(stream)
        .await?;

    let response = TcpResponseHeader::read_from(stream).await.map_err(io::Error::from)?;
    trace!("socks5 CONNECT {} reply {}", target, response.reply);

    match response.reply {
        Reply::Succeeded => Ok(()),
        reply => Err(io::Error::new(
            ErrorKind::ConnectionAborted,
            format!("destination unreachable: {target} ({reply})"),
        )),
    }
}

/// Performs method negotiation on a fresh connection to a SOCKS5 server,
/// running the username/password subnegotiation when the server picks it.
/// Shared by the TCP and UDP connectors.
pub(crate) async fn negotiate_method(stream: &mut BoxedConn, auth: &Option<Auth>) -> io::Result<()> {
    let methods = match auth {
        Some(..) => vec![socks5::SOCKS5_AUTH_METHOD_PASSWORD, socks5::SOCKS5_AUTH_METHOD_NONE],
        None => vec![socks5::SOCKS5_AUTH_METHOD_NONE],
    };
    HandshakeRequest::new(methods).write_to(stream).await?;

    let response = HandshakeResponse::read_from(stream).await.map_err(io::Error::from)?;
    match response.chosen_method {
        socks5::SOCKS5_AUTH_METHOD_NONE => Ok(()),
        socks5::SOCKS5_AUTH_METHOD_PASSWORD => match auth {
            Some(auth) => authenticate_passwd(stream, auth).await,
            None => Err(io::Error::new(
                ErrorKind::PermissionDenied,
                "proxy requires username/password authentication",
            )),
        },
        method => Err(io::Error::new(
            ErrorKind::PermissionDenied,
            format!("proxy chose unsupported auth method {method:#x}"),
        )),
    }
}

async fn authenticate_passwd(stream: &mut BoxedConn, auth: &Auth) -> io::Result<()> {
    let request = PasswdAuthRequest::new(auth.username.as_str(), auth.password.as_deref().unwrap_or(""));
    request.write_to(stream).await?;

    let response = PasswdAuthResponse::read_from(stream).await.map_err(io::Error::from)?;
    if response.status != 0 {
        return Err(socks5::Error::PasswdAuthFailure(response.status).into());
    }
    Ok(())
}
