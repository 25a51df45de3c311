//! Listener decoration
//!
//! Optional behaviors are layered around a raw accept source in one fixed
//! order. Every layer keeps the accept/close/address semantics of what it
//! wraps and is skipped entirely when its capability is unset. A denied or
//! broken connection is dealt with inside the layer; the caller only ever
//! sees the next usable connection or a listener-level error.

use crate::core::hooks::{AdmissionPolicy, ListenerMetrics, RateLimiterRegistry};
use crate::listener::proxy_proto::read_proxy_header;
use crate::listener::{ListenerOptions, StreamAccept};
use crate::transport::{PrependStream, TransportStream};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Application order of the wrap layers to an accepted connection.
/// Proxy-protocol must be consumed before TLS negotiation, and admission /
/// rate limiting act on the immediate TCP peer because they sit outside the
/// proxy-protocol unwrap.
pub const WRAP_ORDER: [&str; 5] = [
    "metrics",
    "admission",
    "rate_limit",
    "proxy_protocol",
    "tls",
];

/// Compose the configured layers around `raw` in `WRAP_ORDER`.
pub fn wrap(raw: Box<dyn StreamAccept>, options: &ListenerOptions) -> Box<dyn StreamAccept> {
    let mut ln = raw;
    if let Some(metrics) = &options.metrics {
        ln = Box::new(MetricsAccept {
            inner: ln,
            metrics: Arc::clone(metrics),
        });
    }
    if let Some(policy) = &options.admission {
        ln = Box::new(AdmissionAccept {
            inner: ln,
            policy: Arc::clone(policy),
            metrics: options.metrics.clone(),
        });
    }
    if let Some(limiter) = &options.rate_limiter {
        ln = Box::new(RateLimitAccept {
            inner: ln,
            limiter: Arc::clone(limiter),
            metrics: options.metrics.clone(),
        });
    }
    if let Some(cfg) = &options.proxy_protocol {
        ln = Box::new(ProxyProtoAccept {
            inner: ln,
            header_timeout: cfg.header_timeout,
        });
    }
    if let Some(acceptor) = &options.tls {
        ln = Box::new(TlsAccept {
            inner: ln,
            acceptor: acceptor.clone(),
            handshake_timeout: options.tls_handshake_timeout,
        });
    }
    ln
}

struct MetricsAccept {
    inner: Box<dyn StreamAccept>,
    metrics: Arc<dyn ListenerMetrics>,
}

#[async_trait]
impl StreamAccept for MetricsAccept {
    async fn accept(&self) -> io::Result<(TransportStream, SocketAddr)> {
        match self.inner.accept().await {
            Ok(accepted) => {
                self.metrics.on_accept();
                Ok(accepted)
            }
            Err(e) => {
                self.metrics.on_error();
                Err(e)
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

struct AdmissionAccept {
    inner: Box<dyn StreamAccept>,
    policy: Arc<dyn AdmissionPolicy>,
    metrics: Option<Arc<dyn ListenerMetrics>>,
}

#[async_trait]
impl StreamAccept for AdmissionAccept {
    async fn accept(&self) -> io::Result<(TransportStream, SocketAddr)> {
        loop {
            let (stream, peer) = self.inner.accept().await?;
            if self.policy.allow(peer) {
                return Ok((stream, peer));
            }
            debug!(peer = %peer, "connection denied by admission policy");
            if let Some(metrics) = &self.metrics {
                metrics.on_denied();
            }
            // dropping the stream closes it; keep accepting
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

struct RateLimitAccept {
    inner: Box<dyn StreamAccept>,
    limiter: Arc<dyn RateLimiterRegistry>,
    metrics: Option<Arc<dyn ListenerMetrics>>,
}

#[async_trait]
impl StreamAccept for RateLimitAccept {
    async fn accept(&self) -> io::Result<(TransportStream, SocketAddr)> {
        loop {
            let (stream, peer) = self.inner.accept().await?;
            let allowed = match self.limiter.limiter_for(&peer.ip().to_string()) {
                Some(limiter) => limiter.allow(1),
                None => true,
            };
            if allowed {
                return Ok((stream, peer));
            }
            debug!(peer = %peer, "connection denied by rate limiter");
            if let Some(metrics) = &self.metrics {
                metrics.on_denied();
            }
            drop(stream);
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

struct ProxyProtoAccept {
    inner: Box<dyn StreamAccept>,
    header_timeout: Duration,
}

#[async_trait]
impl StreamAccept for ProxyProtoAccept {
    async fn accept(&self) -> io::Result<(TransportStream, SocketAddr)> {
        loop {
            let (mut stream, peer) = self.inner.accept().await?;
            match tokio::time::timeout(self.header_timeout, read_proxy_header(&mut stream)).await
            {
                Ok(Ok((source, remainder))) => {
                    let stream: TransportStream =
                        Box::pin(PrependStream::new(stream, remainder));
                    return Ok((stream, source.unwrap_or(peer)));
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "bad proxy protocol header");
                }
                Err(_) => {
                    debug!(peer = %peer, "timed out reading proxy protocol header");
                }
            }
            // only this connection fails; the listener keeps accepting
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

struct TlsAccept {
    inner: Box<dyn StreamAccept>,
    acceptor: tokio_rustls::TlsAcceptor,
    handshake_timeout: Duration,
}

#[async_trait]
impl StreamAccept for TlsAccept {
    async fn accept(&self) -> io::Result<(TransportStream, SocketAddr)> {
        loop {
            let (stream, peer) = self.inner.accept().await?;
            match tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream)).await
            {
                Ok(Ok(tls_stream)) => return Ok((Box::pin(tls_stream), peer)),
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                }
                Err(_) => {
                    debug!(peer = %peer, "TLS handshake timeout");
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::RateLimiter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Mutex;

    /// Accept source fed from a prepared list of in-memory streams
    struct ScriptedAccept {
        streams: Mutex<Vec<(TransportStream, SocketAddr)>>,
    }

    impl ScriptedAccept {
        fn new(streams: Vec<(TransportStream, SocketAddr)>) -> Self {
            Self {
                streams: Mutex::new(streams),
            }
        }
    }

    #[async_trait]
    impl StreamAccept for ScriptedAccept {
        async fn accept(&self) -> io::Result<(TransportStream, SocketAddr)> {
            let mut streams = self.streams.lock().await;
            match streams.pop() {
                Some(entry) => Ok(entry),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "script done")),
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    fn scripted(peers: &[&str]) -> (ScriptedAccept, Vec<tokio::io::DuplexStream>) {
        let mut streams = Vec::new();
        let mut remotes = Vec::new();
        // pushed in reverse so pop() yields them in order
        for peer in peers.iter().rev() {
            let (near, far) = tokio::io::duplex(1024);
            streams.push((Box::pin(near) as TransportStream, peer.parse().unwrap()));
            remotes.push(far);
        }
        remotes.reverse();
        (ScriptedAccept::new(streams), remotes)
    }

    #[derive(Default)]
    struct Counters {
        accepted: AtomicUsize,
        denied: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ListenerMetrics for Counters {
        fn on_accept(&self) {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        }
        fn on_denied(&self) {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
        fn on_error(&self) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct DenyList(Vec<std::net::IpAddr>);

    impl AdmissionPolicy for DenyList {
        fn allow(&self, addr: SocketAddr) -> bool {
            !self.0.contains(&addr.ip())
        }
    }

    struct AlwaysDenyLimiter;

    impl RateLimiter for AlwaysDenyLimiter {
        fn allow(&self, _n: usize) -> bool {
            false
        }
    }

    struct LimitOneHost(std::net::IpAddr);

    impl RateLimiterRegistry for LimitOneHost {
        fn limiter_for(&self, host: &str) -> Option<Arc<dyn RateLimiter>> {
            if host == self.0.to_string() {
                Some(Arc::new(AlwaysDenyLimiter))
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn test_no_capabilities_is_passthrough() {
        let (raw, _remotes) = scripted(&["192.0.2.1:1000"]);
        let options = ListenerOptions::default();
        let wrapped = wrap(Box::new(raw), &options);

        let (_stream, peer) = wrapped.accept().await.unwrap();
        assert_eq!(peer, "192.0.2.1:1000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_admission_denial_skips_to_next_connection() {
        let (raw, _remotes) = scripted(&["203.0.113.7:1000", "192.0.2.1:2000"]);
        let options = ListenerOptions {
            admission: Some(Arc::new(DenyList(vec!["203.0.113.7".parse().unwrap()]))),
            ..Default::default()
        };
        let wrapped = wrap(Box::new(raw), &options);

        // The denied connection never surfaces; accept yields the next one
        let (_stream, peer) = wrapped.accept().await.unwrap();
        assert_eq!(peer, "192.0.2.1:2000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_denial_skips_to_next_connection() {
        let (raw, _remotes) = scripted(&["203.0.113.7:1000", "203.0.113.7:1001", "192.0.2.1:2000"]);
        let options = ListenerOptions {
            rate_limiter: Some(Arc::new(LimitOneHost("203.0.113.7".parse().unwrap()))),
            ..Default::default()
        };
        let wrapped = wrap(Box::new(raw), &options);

        let (_stream, peer) = wrapped.accept().await.unwrap();
        assert_eq!(peer, "192.0.2.1:2000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_metrics_count_accepts_and_denials() {
        let counters = Arc::new(Counters::default());
        let (raw, _remotes) = scripted(&["203.0.113.7:1000", "192.0.2.1:2000"]);
        let options = ListenerOptions {
            metrics: Some(counters.clone() as Arc<dyn ListenerMetrics>),
            admission: Some(Arc::new(DenyList(vec!["203.0.113.7".parse().unwrap()]))),
            ..Default::default()
        };
        let wrapped = wrap(Box::new(raw), &options);

        let _ = wrapped.accept().await.unwrap();
        // Both connections passed the metrics layer; one was then denied
        assert_eq!(counters.accepted.load(Ordering::Relaxed), 2);
        assert_eq!(counters.denied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_proxy_protocol_rewrites_peer() {
        let (raw, mut remotes) = scripted(&["192.0.2.1:1000"]);
        let options = ListenerOptions {
            proxy_protocol: Some(crate::listener::ProxyProtocolConfig::default()),
            ..Default::default()
        };
        let wrapped = wrap(Box::new(raw), &options);

        let far = &mut remotes[0];
        far.write_all(b"PROXY TCP4 203.0.113.9 10.0.0.5 52000 443\r\npayload")
            .await
            .unwrap();

        let (mut stream, peer) = wrapped.accept().await.unwrap();
        // Rate limiting / admission would have seen 192.0.2.1; the consumer
        // sees the declared real peer
        assert_eq!(peer, "203.0.113.9:52000".parse().unwrap());

        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[tokio::test]
    async fn test_proxy_protocol_headerless_fallback() {
        let (raw, mut remotes) = scripted(&["192.0.2.1:1000"]);
        let options = ListenerOptions {
            proxy_protocol: Some(crate::listener::ProxyProtocolConfig::default()),
            ..Default::default()
        };
        let wrapped = wrap(Box::new(raw), &options);

        remotes[0].write_all(b"ordinary data").await.unwrap();

        let (mut stream, peer) = wrapped.accept().await.unwrap();
        assert_eq!(peer, "192.0.2.1:1000".parse().unwrap());

        let mut buf = [0u8; 13];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ordinary data");
    }

    #[tokio::test]
    async fn test_proxy_protocol_timeout_fails_single_connection() {
        let (raw, mut remotes) = scripted(&["203.0.113.7:1000", "192.0.2.1:2000"]);
        let options = ListenerOptions {
            proxy_protocol: Some(crate::listener::ProxyProtocolConfig {
                header_timeout: Duration::from_millis(50),
            }),
            ..Default::default()
        };
        let wrapped = wrap(Box::new(raw), &options);

        // First peer sends a header prefix and stalls; second sends real data
        remotes[0].write_all(b"PROXY ").await.unwrap();
        remotes[1].write_all(b"fresh").await.unwrap();

        let (mut stream, peer) = wrapped.accept().await.unwrap();
        assert_eq!(peer, "192.0.2.1:2000".parse().unwrap());
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"fresh");
    }

    #[test]
    fn test_wrap_order_is_fixed() {
        assert_eq!(
            WRAP_ORDER,
            ["metrics", "admission", "rate_limit", "proxy_protocol", "tls"]
        );
    }
}
