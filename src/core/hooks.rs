//! Hook traits for external collaborators
//!
//! Narrow contracts consumed by listeners and handlers. Implementations are
//! injected at construction; nothing here reaches into their internals.

use crate::core::session::SessionRecord;
use crate::transport::{Network, TransportStream};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

/// Outbound dialer used by handlers to reach the resolved destination.
#[async_trait]
pub trait Router: Send + Sync {
    async fn dial(&self, network: Network, addr: &str) -> io::Result<TransportStream>;
}

/// Rule set deciding which destinations must not be proxied.
pub trait BypassPolicy: Send + Sync {
    fn contains(&self, network: Network, addr: &str) -> bool;
}

/// One token bucket.
///
/// Synchronous by design: a limiter decision is a counter check, not an
/// I/O operation.
pub trait RateLimiter: Send + Sync {
    fn allow(&self, n: usize) -> bool;
}

/// Per-host limiter lookup; `None` means the host is unlimited.
pub trait RateLimiterRegistry: Send + Sync {
    fn limiter_for(&self, host: &str) -> Option<Arc<dyn RateLimiter>>;
}

/// Sink for per-session records. Fire-and-forget: callers never await
/// delivery.
pub trait Recorder: Send + Sync {
    fn record(&self, record: &SessionRecord);
}

/// Accept-time allow/deny decision on the peer address.
pub trait AdmissionPolicy: Send + Sync {
    fn allow(&self, addr: SocketAddr) -> bool;
}

/// Accept-side counters for a listener.
pub trait ListenerMetrics: Send + Sync {
    fn on_accept(&self);
    fn on_denied(&self);
    fn on_error(&self);
}

/// Default router: dial the destination directly over TCP.
pub struct DirectRouter {
    connect_timeout: Duration,
    tcp_nodelay: bool,
}

impl DirectRouter {
    pub fn new(connect_timeout: Duration, tcp_nodelay: bool) -> Self {
        Self {
            connect_timeout,
            tcp_nodelay,
        }
    }
}

impl Default for DirectRouter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), true)
    }
}

#[async_trait]
impl Router for DirectRouter {
    async fn dial(&self, network: Network, addr: &str) -> io::Result<TransportStream> {
        match network {
            Network::Tcp => {
                let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::TimedOut, "TCP connect timeout")
                    })??;
                if self.tcp_nodelay {
                    let _ = stream.set_nodelay(true);
                }
                Ok(Box::pin(stream))
            }
            Network::Udp => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "direct router does not dial udp",
            )),
        }
    }
}

/// Default recorder: emit each session record as a JSON log line.
pub struct LogRecorder;

impl Recorder for LogRecorder {
    fn record(&self, record: &SessionRecord) {
        match serde_json::to_string(record) {
            Ok(entry) => info!(target: "relayd::recorder", "{}", entry),
            Err(e) => info!(target: "relayd::recorder", error = %e, sid = record.sid, "unserializable record"),
        }
    }
}
