//! SOCKS5 protocol (RFC 1928) with username/password authentication (RFC 1929)

use std::{
    fmt::{self, Debug, Display, Formatter},
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use self::consts::{SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE, SOCKS5_AUTH_METHOD_PASSWORD};

#[rustfmt::skip]
mod consts {
    pub const SOCKS5_VERSION:                          u8 = 0x05;
    pub const SOCKS5_PASSWD_AUTH_VERSION:              u8 = 0x01;

    pub const SOCKS5_AUTH_METHOD_NONE:                 u8 = 0x00;
    pub const SOCKS5_AUTH_METHOD_PASSWORD:             u8 = 0x02;
    pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE:       u8 = 0xff;

    pub const SOCKS5_CMD_TCP_CONNECT:                  u8 = 0x01;
    pub const SOCKS5_CMD_TCP_BIND:                     u8 = 0x02;
    pub const SOCKS5_CMD_UDP_ASSOCIATE:                u8 = 0x03;

    pub const SOCKS5_ADDR_TYPE_IPV4:                   u8 = 0x01;
    pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME:            u8 = 0x03;
    pub const SOCKS5_ADDR_TYPE_IPV6:                   u8 = 0x04;

    pub const SOCKS5_REPLY_SUCCEEDED:                  u8 = 0x00;
    pub const SOCKS5_REPLY_GENERAL_FAILURE:            u8 = 0x01;
    pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED:     u8 = 0x02;
    pub const SOCKS5_REPLY_NETWORK_UNREACHABLE:        u8 = 0x03;
    pub const SOCKS5_REPLY_HOST_UNREACHABLE:           u8 = 0x04;
    pub const SOCKS5_REPLY_CONNECTION_REFUSED:         u8 = 0x05;
    pub const SOCKS5_REPLY_TTL_EXPIRED:                u8 = 0x06;
    pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED:      u8 = 0x07;
    pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS5 command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// CONNECT (TCP tunnel)
    TcpConnect,
    /// BIND (unsupported)
    TcpBind,
    /// UDP ASSOCIATE
    UdpAssociate,
}

impl Command {
    #[rustfmt::skip]
    fn as_u8(self) -> u8 {
        match self {
            Command::TcpConnect   => consts::SOCKS5_CMD_TCP_CONNECT,
            Command::TcpBind      => consts::SOCKS5_CMD_TCP_BIND,
            Command::UdpAssociate => consts::SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }

    #[rustfmt::skip]
    fn from_u8(code: u8) -> Option<Command> {
        match code {
            consts::SOCKS5_CMD_TCP_CONNECT   => Some(Command::TcpConnect),
            consts::SOCKS5_CMD_TCP_BIND      => Some(Command::TcpBind),
            consts::SOCKS5_CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _                                => None,
        }
    }
}

/// SOCKS5 reply code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    OtherReply(u8),
}

impl Reply {
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Reply::Succeeded               => consts::SOCKS5_REPLY_SUCCEEDED,
            Reply::GeneralFailure          => consts::SOCKS5_REPLY_GENERAL_FAILURE,
            Reply::ConnectionNotAllowed    => consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
            Reply::NetworkUnreachable      => consts::SOCKS5_REPLY_NETWORK_UNREACHABLE,
            Reply::HostUnreachable         => consts::SOCKS5_REPLY_HOST_UNREACHABLE,
            Reply::ConnectionRefused       => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
            Reply::TtlExpired              => consts::SOCKS5_REPLY_TTL_EXPIRED,
            Reply::CommandNotSupported     => consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            Reply::AddressTypeNotSupported => consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            Reply::OtherReply(c)           => c,
        }
    }

    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Reply {
        match code {
            consts::SOCKS5_REPLY_SUCCEEDED                  => Reply::Succeeded,
            consts::SOCKS5_REPLY_GENERAL_FAILURE            => Reply::GeneralFailure,
            consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED     => Reply::ConnectionNotAllowed,
            consts::SOCKS5_REPLY_NETWORK_UNREACHABLE        => Reply::NetworkUnreachable,
            consts::SOCKS5_REPLY_HOST_UNREACHABLE           => Reply::HostUnreachable,
            consts::SOCKS5_REPLY_CONNECTION_REFUSED         => Reply::ConnectionRefused,
            consts::SOCKS5_REPLY_TTL_EXPIRED                => Reply::TtlExpired,
            consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED      => Reply::CommandNotSupported,
            consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => Reply::AddressTypeNotSupported,
            _                                               => Reply::OtherReply(code),
        }
    }
}

impl Display for Reply {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Reply::Succeeded               => f.write_str("succeeded"),
            Reply::GeneralFailure          => f.write_str("general failure"),
            Reply::ConnectionNotAllowed    => f.write_str("connection not allowed"),
            Reply::NetworkUnreachable      => f.write_str("network unreachable"),
            Reply::HostUnreachable         => f.write_str("host unreachable"),
            Reply::ConnectionRefused       => f.write_str("connection refused"),
            Reply::TtlExpired              => f.write_str("TTL expired"),
            Reply::CommandNotSupported     => f.write_str("command not supported"),
            Reply::AddressTypeNotSupported => f.write_str("address type not supported"),
            Reply::OtherReply(c)           => write!(f, "other reply ({c})"),
        }
    }
}

/// SOCKS5 protocol error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unsupported socks version {0:#x}")]
    UnsupportedSocksVersion(u8),
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("domain name in address is not valid UTF-8")]
    AddressDomainInvalidEncoding,
    #[error("unsupported username/password auth version {0:#x}")]
    UnsupportedPasswdAuthVersion(u8),
    #[error("username/password authentication failed, status {0:#x}")]
    PasswdAuthFailure(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableAuthMethod,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(err) => err,
            e => io::Error::new(ErrorKind::Other, e),
        }
    }
}

impl Error {
    /// The reply code a server should send back for this error
    pub fn as_reply(&self) -> Reply {
        match *self {
            Error::Io(ref err) => match err.kind() {
                ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                _ => Reply::GeneralFailure,
            },
            Error::UnsupportedCommand(..) => Reply::CommandNotSupported,
            Error::AddressTypeNotSupported(..) => Reply::AddressTypeNotSupported,
            _ => Reply::GeneralFailure,
        }
    }
}

/// SOCKS5 address, either a socket address or a domain name with port
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    SocketAddress(SocketAddr),
    DomainNameAddress(String, u16),
}

impl Address {
    /// Read one address (ATYP + ADDR + PORT) from an async reader
    pub async fn read_from<R>(r: &mut R) -> Result<Address, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut atyp = [0u8; 1];
        r.read_exact(&mut atyp).await?;

        match atyp[0] {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 6];
                r.read_exact(&mut buf).await?;
                let addr = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 18];
                r.read_exact(&mut buf).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let addr = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(
                    addr, port, 0, 0,
                ))))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let mut len = [0u8; 1];
                r.read_exact(&mut len).await?;

                // Len(Domain) + Len(Port)
                let mut buf = vec![0u8; len[0] as usize + 2];
                r.read_exact(&mut buf).await?;

                let port = u16::from_be_bytes([buf[len[0] as usize], buf[len[0] as usize + 1]]);
                buf.truncate(len[0] as usize);
                let domain = String::from_utf8(buf).map_err(|_| Error::AddressDomainInvalidEncoding)?;
                Ok(Address::DomainNameAddress(domain, port))
            }
            t => Err(Error::AddressTypeNotSupported(t)),
        }
    }

    /// Parse one address from the beginning of `buf`, returning the address
    /// and the number of bytes consumed
    pub fn parse_from(buf: &[u8]) -> Result<(Address, usize), Error> {
        let invalid = || Error::Io(io::Error::new(ErrorKind::UnexpectedEof, "truncated address"));

        if buf.is_empty() {
            return Err(invalid());
        }
        match buf[0] {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(invalid());
                }
                let addr = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))), 7))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(invalid());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))),
                    19,
                ))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                if buf.len() < 2 {
                    return Err(invalid());
                }
                let len = buf[1] as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(invalid());
                }
                let domain =
                    String::from_utf8(buf[2..2 + len].to_vec()).map_err(|_| Error::AddressDomainInvalidEncoding)?;
                let port = u16::from_be_bytes([buf[2 + len], buf[2 + len + 1]]);
                Ok((Address::DomainNameAddress(domain, port), 2 + len + 2))
            }
            t => Err(Error::AddressTypeNotSupported(t)),
        }
    }

    /// Write the address to a buffer
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Address::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddress(ref domain, port) => {
                debug_assert!(domain.len() <= u8::MAX as usize, "domain name longer than 255 bytes");
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Encoded length in bytes
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(ref domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Port of the address
    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(.., port) => port,
        }
    }

    /// An unspecified `0.0.0.0:0` / `[::]:0` address of the same family
    pub fn unspecified_of_same_family(&self) -> Address {
        let ip = match *self {
            Address::SocketAddress(SocketAddr::V6(..)) => Ipv6Addr::UNSPECIFIED.into(),
            _ => Ipv4Addr::UNSPECIFIED.into(),
        };
        Address::SocketAddress(SocketAddr::new(ip, 0))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address::SocketAddress(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Address {
        Address::DomainNameAddress(domain, port)
    }
}

async fn write_buf<W>(buf: &BytesMut, w: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(buf).await?;
    w.flush().await
}

/// Method negotiation request
///
/// ```plain
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct HandshakeRequest {
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    pub fn new(methods: Vec<u8>) -> HandshakeRequest {
        HandshakeRequest { methods }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<HandshakeRequest, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;

        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }

        let mut methods = vec![0u8; buf[1] as usize];
        r.read_exact(&mut methods).await?;
        Ok(HandshakeRequest { methods })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(2 + self.methods.len());
        buf.put_slice(&[consts::SOCKS5_VERSION, self.methods.len() as u8]);
        buf.put_slice(&self.methods);
        write_buf(&buf, w).await
    }
}

/// Method negotiation response
///
/// ```plain
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Clone, Copy, Debug)]
pub struct HandshakeResponse {
    pub chosen_method: u8,
}

impl HandshakeResponse {
    pub fn new(method: u8) -> HandshakeResponse {
        HandshakeResponse { chosen_method: method }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<HandshakeResponse, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;

        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        Ok(HandshakeResponse { chosen_method: buf[1] })
    }

    pub async fn write_to<W>(self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_slice(&[consts::SOCKS5_VERSION, self.chosen_method]);
        write_buf(&buf, w).await
    }
}

/// Username/password auth request (RFC 1929)
///
/// ```plain
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 0 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct PasswdAuthRequest {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl PasswdAuthRequest {
    pub fn new<U, P>(username: U, password: P) -> PasswdAuthRequest
    where
        U: Into<Vec<u8>>,
        P: Into<Vec<u8>>,
    {
        let username = username.into();
        let password = password.into();
        debug_assert!(username.len() <= u8::MAX as usize && password.len() <= u8::MAX as usize);
        PasswdAuthRequest { username, password }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<PasswdAuthRequest, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;
        if buf[0] != consts::SOCKS5_PASSWD_AUTH_VERSION {
            return Err(Error::UnsupportedPasswdAuthVersion(buf[0]));
        }

        let mut username = vec![0u8; buf[1] as usize];
        r.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        r.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        r.read_exact(&mut password).await?;

        Ok(PasswdAuthRequest { username, password })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(3 + self.username.len() + self.password.len());
        buf.put_u8(consts::SOCKS5_PASSWD_AUTH_VERSION);
        buf.put_u8(self.username.len() as u8);
        buf.put_slice(&self.username);
        buf.put_u8(self.password.len() as u8);
        buf.put_slice(&self.password);
        write_buf(&buf, w).await
    }
}

/// Username/password auth response, status 0 means success
#[derive(Clone, Copy, Debug)]
pub struct PasswdAuthResponse {
    pub status: u8,
}

impl PasswdAuthResponse {
    pub fn new(status: u8) -> PasswdAuthResponse {
        PasswdAuthResponse { status }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<PasswdAuthResponse, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;
        if buf[0] != consts::SOCKS5_PASSWD_AUTH_VERSION {
            return Err(Error::UnsupportedPasswdAuthVersion(buf[0]));
        }
        Ok(PasswdAuthResponse { status: buf[1] })
    }

    pub async fn write_to<W>(self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_slice(&[consts::SOCKS5_PASSWD_AUTH_VERSION, self.status]);
        write_buf(&buf, w).await
    }
}

/// Request header sent after method negotiation
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpRequestHeader {
    pub command: Command,
    pub address: Address,
}

impl TcpRequestHeader {
    pub fn new(command: Command, address: Address) -> TcpRequestHeader {
        TcpRequestHeader { command, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<TcpRequestHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await?;

        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        let command = Command::from_u8(buf[1]).ok_or(Error::UnsupportedCommand(buf[1]))?;
        let address = Address::read_from(r).await?;
        Ok(TcpRequestHeader { command, address })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(3 + self.address.serialized_len());
        buf.put_slice(&[consts::SOCKS5_VERSION, self.command.as_u8(), 0x00]);
        self.address.write_to_buf(&mut buf);
        write_buf(&buf, w).await
    }
}

/// Response header
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpResponseHeader {
    pub reply: Reply,
    pub address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> TcpResponseHeader {
        TcpResponseHeader { reply, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<TcpResponseHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await?;

        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        let reply = Reply::from_u8(buf[1]);
        let address = Address::read_from(r).await?;
        Ok(TcpResponseHeader { reply, address })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(3 + self.address.serialized_len());
        buf.put_slice(&[consts::SOCKS5_VERSION, self.reply.as_u8(), 0x00]);
        self.address.write_to_buf(&mut buf);
        write_buf(&buf, w).await
    }
}

/// Header prepended to every relayed UDP datagram
///
/// ```plain
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct UdpAssociateHeader {
    /// Fragment number, 0 for a standalone datagram. Fragmentation is not
    /// supported, non-zero fragments are rejected.
    pub frag: u8,
    pub address: Address,
}

impl UdpAssociateHeader {
    pub fn new(frag: u8, address: Address) -> UdpAssociateHeader {
        UdpAssociateHeader { frag, address }
    }

    /// Parse the header from the beginning of a datagram, returning the
    /// header and its encoded length
    pub fn parse_from(buf: &[u8]) -> Result<(UdpAssociateHeader, usize), Error> {
        if buf.len() < 3 {
            return Err(Error::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "truncated UDP header",
            )));
        }
        let frag = buf[2];
        let (address, addr_len) = Address::parse_from(&buf[3..])?;
        Ok((UdpAssociateHeader { frag, address }, 3 + addr_len))
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[0x00, 0x00, self.frag]);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_codec_v4() {
        let addr = Address::SocketAddress("127.0.0.1:1080".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(buf.len(), addr.serialized_len());

        let (parsed, consumed) = Address::parse_from(&buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn address_codec_v6() {
        let addr = Address::SocketAddress("[2001:db8::1]:53".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);

        let (parsed, consumed) = Address::parse_from(&buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn address_codec_domain() {
        let addr = Address::DomainNameAddress("example.com".to_owned(), 443);
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);

        let (parsed, consumed) = Address::parse_from(&buf).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed.to_string(), "example.com:443");
    }

    #[test]
    fn address_truncated() {
        let addr = Address::SocketAddress("10.0.0.1:53".parse().unwrap());
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert!(Address::parse_from(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn udp_header_roundtrip() {
        let header = UdpAssociateHeader::new(0, Address::SocketAddress("8.8.8.8:53".parse().unwrap()));
        let mut buf = BytesMut::new();
        header.write_to_buf(&mut buf);
        buf.put_slice(b"payload");

        let (parsed, consumed) = UdpAssociateHeader::parse_from(&buf).unwrap();
        assert_eq!(parsed.frag, 0);
        assert_eq!(parsed.address, header.address);
        assert_eq!(&buf[consumed..], b"payload");
    }

    #[tokio::test]
    async fn request_header_roundtrip() {
        let req = TcpRequestHeader::new(Command::TcpConnect, Address::DomainNameAddress("example.org".into(), 80));

        let mut wire = Vec::new();
        req.write_to(&mut wire).await.unwrap();

        let mut cursor = &wire[..];
        let parsed = TcpRequestHeader::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed.command, Command::TcpConnect);
        assert_eq!(parsed.address, req.address);
    }

    #[tokio::test]
    async fn unsupported_version_rejected() {
        let wire = [0x04u8, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38];
        let mut cursor = &wire[..];
        match TcpRequestHeader::read_from(&mut cursor).await {
            Err(Error::UnsupportedSocksVersion(0x04)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
