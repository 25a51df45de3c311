//! Transport layer types
//!
//! Unified byte-stream abstraction shared by listeners and handlers, plus
//! per-connection metadata.

pub mod exchange;
pub mod prepend;

pub use exchange::ExchangeStream;
pub use prepend::PrependStream;

use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified transport stream type
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// Transport-layer network of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection metadata
///
/// `local_addr` is the locally-bound address of the accepted connection; for
/// transparently redirected traffic it carries the original destination.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
    /// Locally-bound address
    pub local_addr: SocketAddr,
    /// Network the connection arrived on
    pub network: Network,
}

/// Parse a declared peer address, falling back to 0.0.0.0:0
pub fn parse_peer_addr(addr: &str) -> SocketAddr {
    addr.parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}
