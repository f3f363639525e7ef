//! sockspin is a SOCKS5 proxy rotator with a transparent proxy container.
//!
//! Two operating modes:
//!
//! - **server**: a SOCKS5 endpoint that load-balances incoming CONNECT and
//!   UDP ASSOCIATE requests across a pool of upstream SOCKS5 proxies
//! - **run**: spawns an arbitrary command inside an isolated network
//!   namespace whose only egress is a TUN interface; captured TCP/UDP flows
//!   are terminated by a user-space network stack and forwarded through a
//!   chain of upstream SOCKS5 proxies, with optional local NAT redirects

pub mod config;
pub mod connect;
#[cfg(unix)]
pub mod ipc;
pub mod logging;
pub mod monitor;
pub mod relay;
pub mod server;
pub mod service;
#[cfg(target_os = "linux")]
pub mod stack;
pub mod sys;

/// sockspin version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
