//! Listener layer
//!
//! A listener accepts full-duplex byte streams. Raw TCP accept sources are
//! decorated by the wrap chain (`wrap`) and adapted by protocol-specific
//! listeners (`http2`) into the uniform `Listener` contract the service
//! loop consumes.

pub mod http2;
pub mod proxy_proto;
pub mod wrap;

pub use http2::Http2Listener;

use crate::config::Metadata;
use crate::core::hooks::{AdmissionPolicy, ListenerMetrics, RateLimiterRegistry};
use crate::error::Result;
use crate::transport::{ConnectionMeta, TransportStream};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// One accepted connection: the stream plus its addressing metadata
pub struct Accepted {
    pub stream: TransportStream,
    pub meta: ConnectionMeta,
}

/// Protocol-specific connection acceptor.
///
/// Lifecycle: construct with options, `init` once with metadata (binds the
/// socket and starts serving), then `accept` until it returns a terminal
/// error. `close` is idempotent.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn init(&mut self, md: Metadata) -> Result<()>;

    /// Block until a connection is available or the listener is done.
    /// After `close` (or a fatal transport error) every call returns the
    /// terminal error.
    async fn accept(&self) -> Result<Accepted>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting. Safe to call any number of times, from any task.
    async fn close(&self);
}

/// PROXY protocol acceptance settings
#[derive(Debug, Clone)]
pub struct ProxyProtocolConfig {
    /// Bound on how long one accept may stall reading the header
    pub header_timeout: Duration,
}

impl Default for ProxyProtocolConfig {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(10),
        }
    }
}

/// Capabilities and settings injected into a listener at construction
pub struct ListenerOptions {
    /// Service name used in logs
    pub service: String,
    /// Bind address
    pub addr: String,
    /// Transport security; pass-through when unset
    pub tls: Option<tokio_rustls::TlsAcceptor>,
    pub tls_handshake_timeout: Duration,
    /// Accept-time admission policy; pass-through when unset
    pub admission: Option<Arc<dyn AdmissionPolicy>>,
    /// Accept-time rate limiting; pass-through when unset
    pub rate_limiter: Option<Arc<dyn RateLimiterRegistry>>,
    /// Accept counters; pass-through when unset
    pub metrics: Option<Arc<dyn ListenerMetrics>>,
    /// PROXY protocol unwrapping; pass-through when unset
    pub proxy_protocol: Option<ProxyProtocolConfig>,
    pub tcp_nodelay: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            service: "relayd".to_string(),
            addr: "127.0.0.1:0".to_string(),
            tls: None,
            tls_handshake_timeout: Duration::from_secs(10),
            admission: None,
            rate_limiter: None,
            metrics: None,
            proxy_protocol: None,
            tcp_nodelay: true,
        }
    }
}

/// Raw byte-stream accept source, the innermost link of the wrap chain.
#[async_trait]
pub trait StreamAccept: Send + Sync {
    async fn accept(&self) -> io::Result<(TransportStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Plain TCP accept source.
pub struct TcpRawListener {
    inner: tokio::net::TcpListener,
    nodelay: bool,
}

impl TcpRawListener {
    /// Bind with SO_REUSEADDR so restarts do not wait out TIME_WAIT.
    /// Must be called within a tokio runtime.
    pub fn bind(addr: &str, nodelay: bool) -> io::Result<Self> {
        let socket_addr: SocketAddr = addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let socket = socket2::Socket::new(
            match socket_addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(1024)?;

        let inner = tokio::net::TcpListener::from_std(socket.into())?;
        Ok(Self { inner, nodelay })
    }
}

#[async_trait]
impl StreamAccept for TcpRawListener {
    async fn accept(&self) -> io::Result<(TransportStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok((Box::pin(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
