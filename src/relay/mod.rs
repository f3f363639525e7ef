//! Relay primitives shared by the SOCKS5 server, the connector chain and the
//! network stack

use std::time::Duration;

pub mod socks5;
pub mod transport;

pub use self::transport::{TimeoutConn, Transporter};

/// Timeout for establishing an outbound TCP/UDP connection, including the
/// whole SOCKS5 negotiation
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for each TCP read/write during a relay
pub const TCP_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for each UDP read/write during a relay
pub const UDP_IO_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum size of an incoming UDP datagram
pub const MAXIMUM_UDP_PAYLOAD_SIZE: usize = 65536;
