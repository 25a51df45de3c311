//! Transparent redirection handler
//!
//! An intercepted connection arrives with its locally-bound address rewritten
//! by the interception layer to the destination the client originally dialed.
//! The handler recovers the destination from that local address, applies
//! policy, dials upstream through the router and relays bytes until either
//! side ends the session.

use crate::config::Metadata;
use crate::core::relay::copy_duplex;
use crate::core::session::{SessionContext, SessionGuard, SessionRecord};
use crate::error::{ProxyError, Result};
use crate::handler::{Handler, HandlerOptions};
use crate::transport::{ConnectionMeta, TransportStream};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info};

pub struct RedirectHandler {
    options: HandlerOptions,
}

impl RedirectHandler {
    pub fn new(options: HandlerOptions) -> Self {
        Self { options }
    }

    fn check_rate_limit(&self, addr: &SocketAddr) -> bool {
        let Some(registry) = &self.options.rate_limiter else {
            return true;
        };
        match registry.limiter_for(&addr.ip().to_string()) {
            Some(limiter) => limiter.allow(1),
            None => true,
        }
    }

    async fn run(
        &self,
        stream: TransportStream,
        meta: &ConnectionMeta,
        session: &mut SessionGuard,
    ) -> Result<()> {
        if !self.check_rate_limit(&meta.peer_addr) {
            return Err(ProxyError::RateLimited);
        }

        // The transparent-redirect contract: the locally-bound address is the
        // destination the client originally dialed.
        let dst = meta.local_addr;
        session.network = meta.network.as_str().to_string();
        session.host = dst.to_string();

        debug!(sid = session.sid, "{} >> {}", meta.peer_addr, dst);

        if let Some(bypass) = &self.options.bypass {
            if bypass.contains(meta.network, &session.host) {
                debug!(sid = session.sid, "bypass: {}", dst);
                return Err(ProxyError::Bypassed);
            }
        }

        let upstream = match self.options.router.dial(meta.network, &session.host).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!(sid = session.sid, error = %e, "dial {} failed", dst);
                return Err(ProxyError::Dial(e));
            }
        };

        let started = Instant::now();
        info!(sid = session.sid, "{} <-> {}", meta.peer_addr, dst);
        let (result, copied) = copy_duplex(stream, upstream).await;
        session.bytes_sent = copied.a_to_b;
        session.bytes_received = copied.b_to_a;
        info!(
            sid = session.sid,
            duration = ?started.elapsed(),
            up = copied.a_to_b,
            down = copied.b_to_a,
            "{} >-< {}",
            meta.peer_addr,
            dst,
        );
        result.map_err(ProxyError::Transport)
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    async fn init(&mut self, _md: Metadata) -> Result<()> {
        Ok(())
    }

    async fn handle(
        &self,
        ctx: SessionContext,
        stream: TransportStream,
        meta: ConnectionMeta,
    ) -> Result<()> {
        let record = SessionRecord::new(&self.options.service, &meta, ctx.sid);
        let mut session = SessionGuard::new(record, self.options.recorder.clone());

        info!(sid = ctx.sid, "{} <> {}", meta.peer_addr, meta.local_addr);

        // `stream` is owned by run(); every exit path drops and thereby
        // closes it, and the guard flushes the record exactly once.
        let result = self.run(stream, &meta, &mut session).await;
        if let Err(e) = &result {
            session.set_error(e);
        }
        session.finish();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::{
        BypassPolicy, RateLimiter, RateLimiterRegistry, Recorder, Router,
    };
    use crate::transport::Network;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct MockRouter {
        dials: AtomicUsize,
        upstream: Mutex<Option<TransportStream>>,
    }

    impl MockRouter {
        fn with_upstream(upstream: TransportStream) -> Self {
            Self {
                dials: AtomicUsize::new(0),
                upstream: Mutex::new(Some(upstream)),
            }
        }

        fn refusing() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                upstream: Mutex::new(None),
            }
        }

        fn dial_count(&self) -> usize {
            self.dials.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Router for MockRouter {
        async fn dial(&self, _network: Network, _addr: &str) -> io::Result<TransportStream> {
            self.dials.fetch_add(1, Ordering::Relaxed);
            match self.upstream.lock().unwrap().take() {
                Some(stream) => Ok(stream),
                None => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )),
            }
        }
    }

    #[derive(Default)]
    struct CaptureRecorder {
        records: Mutex<Vec<SessionRecord>>,
    }

    impl Recorder for CaptureRecorder {
        fn record(&self, record: &SessionRecord) {
            self.records.lock().unwrap().push(record.clone());
        }
    }

    struct DenyHost(String);

    struct DenyAll;

    impl RateLimiter for DenyAll {
        fn allow(&self, _n: usize) -> bool {
            false
        }
    }

    impl RateLimiterRegistry for DenyHost {
        fn limiter_for(&self, host: &str) -> Option<Arc<dyn RateLimiter>> {
            (host == self.0).then(|| Arc::new(DenyAll) as Arc<dyn RateLimiter>)
        }
    }

    struct BypassList(Vec<String>);

    impl BypassPolicy for BypassList {
        fn contains(&self, _network: Network, addr: &str) -> bool {
            self.0.iter().any(|a| a == addr)
        }
    }

    fn meta(peer: &str, local: &str) -> ConnectionMeta {
        ConnectionMeta {
            peer_addr: peer.parse().unwrap(),
            local_addr: local.parse().unwrap(),
            network: Network::Tcp,
        }
    }

    fn handler(
        router: Arc<MockRouter>,
        bypass: Option<Arc<dyn BypassPolicy>>,
        rate_limiter: Option<Arc<dyn RateLimiterRegistry>>,
        recorder: Arc<CaptureRecorder>,
    ) -> RedirectHandler {
        RedirectHandler::new(HandlerOptions {
            service: "red-test".to_string(),
            router,
            bypass,
            rate_limiter,
            recorder: Some(recorder as Arc<dyn Recorder>),
        })
    }

    #[tokio::test]
    async fn test_relays_until_client_closes() {
        let (client_near, mut client_far) = tokio::io::duplex(4096);
        let (upstream_near, mut upstream_far) = tokio::io::duplex(4096);

        let router = Arc::new(MockRouter::with_upstream(Box::pin(upstream_near)));
        let recorder = Arc::new(CaptureRecorder::default());
        let h = handler(Arc::clone(&router), None, None, Arc::clone(&recorder));

        let session = tokio::spawn(async move {
            h.handle(
                SessionContext { sid: 1 },
                Box::pin(client_near),
                meta("198.51.100.4:40000", "10.0.0.5:443"),
            )
            .await
        });

        client_far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream_far.write_all(b"world").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        // client closes; the session winds down
        drop(client_far);
        drop(upstream_far);
        session.await.unwrap().unwrap();

        let records = recorder.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.host, "10.0.0.5:443");
        assert_eq!(record.network, "tcp");
        assert!(record.err.is_empty());
        assert!(record.duration > Duration::ZERO);
        assert_eq!(record.bytes_sent, 5);
        assert_eq!(record.bytes_received, 5);
        assert_eq!(router.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_peer_is_rejected_before_dial() {
        let (client_near, _client_far) = tokio::io::duplex(1024);
        let router = Arc::new(MockRouter::refusing());
        let recorder = Arc::new(CaptureRecorder::default());
        let h = handler(
            Arc::clone(&router),
            None,
            Some(Arc::new(DenyHost("203.0.113.9".to_string()))),
            Arc::clone(&recorder),
        );

        let result = h
            .handle(
                SessionContext { sid: 2 },
                Box::pin(client_near),
                meta("203.0.113.9:52000", "10.0.0.5:443"),
            )
            .await;

        assert!(matches!(result, Err(ProxyError::RateLimited)));
        assert_eq!(router.dial_count(), 0);

        let records = recorder.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].err, "rate limit exceeded");
    }

    #[tokio::test]
    async fn test_unlimited_peer_passes_rate_limit() {
        let (client_near, client_far) = tokio::io::duplex(1024);
        let (upstream_near, upstream_far) = tokio::io::duplex(1024);
        let router = Arc::new(MockRouter::with_upstream(Box::pin(upstream_near)));
        let recorder = Arc::new(CaptureRecorder::default());
        // limiter registered for a different host only
        let h = handler(
            Arc::clone(&router),
            None,
            Some(Arc::new(DenyHost("203.0.113.9".to_string()))),
            Arc::clone(&recorder),
        );

        drop(client_far);
        drop(upstream_far);
        let result = h
            .handle(
                SessionContext { sid: 3 },
                Box::pin(client_near),
                meta("198.51.100.4:40000", "10.0.0.5:443"),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(router.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_bypassed_destination_is_never_dialed() {
        let (client_near, _client_far) = tokio::io::duplex(1024);
        let router = Arc::new(MockRouter::refusing());
        let recorder = Arc::new(CaptureRecorder::default());
        let h = handler(
            Arc::clone(&router),
            Some(Arc::new(BypassList(vec!["10.0.0.5:443".to_string()]))),
            None,
            Arc::clone(&recorder),
        );

        let result = h
            .handle(
                SessionContext { sid: 4 },
                Box::pin(client_near),
                meta("198.51.100.4:40000", "10.0.0.5:443"),
            )
            .await;

        assert!(matches!(result, Err(ProxyError::Bypassed)));
        assert_eq!(router.dial_count(), 0);

        let records = recorder.records.lock().unwrap();
        assert_eq!(records[0].err, "destination bypassed");
        assert_eq!(records[0].host, "10.0.0.5:443");
    }

    #[tokio::test]
    async fn test_dial_failure_is_recorded() {
        let (client_near, _client_far) = tokio::io::duplex(1024);
        let router = Arc::new(MockRouter::refusing());
        let recorder = Arc::new(CaptureRecorder::default());
        let h = handler(Arc::clone(&router), None, None, Arc::clone(&recorder));

        let result = h
            .handle(
                SessionContext { sid: 5 },
                Box::pin(client_near),
                meta("198.51.100.4:40000", "192.0.2.80:9000"),
            )
            .await;

        assert!(matches!(result, Err(ProxyError::Dial(_))));
        assert_eq!(router.dial_count(), 1);

        let records = recorder.records.lock().unwrap();
        assert!(records[0].err.contains("dial failed"));
        assert!(records[0].duration > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_destination_is_local_addr_not_peer() {
        let (client_near, client_far) = tokio::io::duplex(1024);
        let (upstream_near, upstream_far) = tokio::io::duplex(1024);
        let router = Arc::new(MockRouter::with_upstream(Box::pin(upstream_near)));
        let recorder = Arc::new(CaptureRecorder::default());
        let h = handler(Arc::clone(&router), None, None, Arc::clone(&recorder));

        drop(client_far);
        drop(upstream_far);
        h.handle(
            SessionContext { sid: 6 },
            Box::pin(client_near),
            meta("198.51.100.4:40000", "93.184.216.34:8080"),
        )
        .await
        .unwrap();

        let records = recorder.records.lock().unwrap();
        assert_eq!(records[0].host, "93.184.216.34:8080");
        assert_eq!(records[0].remote_addr, "198.51.100.4:40000");
    }
}
