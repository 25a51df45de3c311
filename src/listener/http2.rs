//! HTTP/2 listener
//!
//! Bridges a request/response transport onto the pull-style `Listener`
//! contract. Every inbound HTTP/2 exchange becomes one synthetic byte-stream
//! connection, handed to `accept` through a bounded FIFO queue. The producer
//! side never blocks: when the queue is full the exchange is abandoned so a
//! slow consumer cannot stall unrelated exchanges multiplexed on the same
//! transport connection.

use crate::config::{
    Metadata, DEFAULT_BACKLOG, MD_BACKLOG, MD_PROXY_HEADER_TIMEOUT, MD_PROXY_PROTOCOL,
};
use crate::error::{ProxyError, Result};
use crate::listener::wrap::wrap;
use crate::listener::{Accepted, Listener, ListenerOptions, StreamAccept, TcpRawListener};
use crate::transport::{ConnectionMeta, ExchangeStream, Network, TransportStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Initial HTTP/2 stream window size (per stream)
const INITIAL_WINDOW_SIZE: u32 = 1024 * 1024;

/// Initial HTTP/2 connection window size (shared across all streams)
const INITIAL_CONNECTION_WINDOW_SIZE: u32 = 4 * 1024 * 1024;

/// HTTP/2 frame size
const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Maximum concurrent HTTP/2 streams per transport connection
const MAX_CONCURRENT_STREAMS: u32 = 128;

/// Listener adapting an HTTP/2 server into the byte-stream accept contract.
///
/// States: created by `new`, serving after `init`, closed after `close` or a
/// fatal transport error. Closed is terminal: every `accept` call from then
/// on returns the terminal error, and `close` stays a no-op.
pub struct Http2Listener {
    options: ListenerOptions,
    addr: Option<SocketAddr>,
    queue: Option<Mutex<mpsc::Receiver<Accepted>>>,
    closed: CancellationToken,
    fatal: Arc<OnceLock<String>>,
}

impl Http2Listener {
    pub fn new(options: ListenerOptions) -> Self {
        Self {
            options,
            addr: None,
            queue: None,
            closed: CancellationToken::new(),
            fatal: Arc::new(OnceLock::new()),
        }
    }

    fn terminal_error(&self) -> ProxyError {
        match self.fatal.get() {
            Some(msg) => ProxyError::Listener(msg.clone()),
            None => ProxyError::Closed,
        }
    }
}

#[async_trait]
impl Listener for Http2Listener {
    async fn init(&mut self, md: Metadata) -> Result<()> {
        let backlog = match md.get_int(MD_BACKLOG) {
            Some(n) if n >= 1 => n as usize,
            Some(n) => {
                return Err(ProxyError::Config(format!("invalid backlog {}", n)));
            }
            None => DEFAULT_BACKLOG,
        };

        if md.get_bool(MD_PROXY_PROTOCOL).unwrap_or(false) && self.options.proxy_protocol.is_none()
        {
            let mut cfg = crate::listener::ProxyProtocolConfig::default();
            if let Some(timeout) = md.get_duration(MD_PROXY_HEADER_TIMEOUT) {
                cfg.header_timeout = timeout;
            }
            self.options.proxy_protocol = Some(cfg);
        }

        let raw = TcpRawListener::bind(&self.options.addr, self.options.tcp_nodelay)?;
        let local_addr = raw.local_addr()?;
        self.addr = Some(local_addr);

        let wrapped = wrap(Box::new(raw), &self.options);

        let (tx, rx) = mpsc::channel(backlog);
        self.queue = Some(Mutex::new(rx));

        tokio::spawn(dispatch(
            wrapped,
            tx,
            local_addr,
            self.closed.clone(),
            Arc::clone(&self.fatal),
        ));

        debug!(addr = %local_addr, backlog, "http2 listener serving");
        Ok(())
    }

    async fn accept(&self) -> Result<Accepted> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| ProxyError::Config("listener not initialized".to_string()))?;

        if self.closed.is_cancelled() {
            return Err(self.terminal_error());
        }

        let mut rx = queue.lock().await;
        tokio::select! {
            // closed wins over a ready connection so accept is deterministic
            // once the listener reached its terminal state
            biased;
            _ = self.closed.cancelled() => Err(self.terminal_error()),
            conn = rx.recv() => match conn {
                Some(accepted) => Ok(accepted),
                None => Err(self.terminal_error()),
            },
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    async fn close(&self) {
        // Idempotent: the token can only transition once, and the dispatch
        // task tears down the transport in response.
        self.closed.cancel();
    }
}

impl Drop for Http2Listener {
    fn drop(&mut self) {
        // A listener dropped without close still tears its tasks down
        self.closed.cancel();
    }
}

/// Background accept loop: wrapped transport connections in, per-connection
/// HTTP/2 serving tasks out.
async fn dispatch(
    listener: Box<dyn StreamAccept>,
    queue: mpsc::Sender<Accepted>,
    local_addr: SocketAddr,
    closed: CancellationToken,
    fatal: Arc<OnceLock<String>>,
) {
    loop {
        let accepted = tokio::select! {
            _ = closed.cancelled() => return,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    local_addr,
                    queue.clone(),
                    closed.child_token(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "transport accept failed, listener is done");
                let _ = fatal.set(e.to_string());
                closed.cancel();
                return;
            }
        }
    }
}

/// Serve one HTTP/2 transport connection: accept exchanges and queue them
/// as synthetic connections. Once the listener closes, stop taking new
/// exchanges but keep driving the connection until in-flight sessions end.
async fn serve_connection(
    stream: TransportStream,
    peer: SocketAddr,
    local_addr: SocketAddr,
    queue: mpsc::Sender<Accepted>,
    cancel: CancellationToken,
) {
    let mut conn = match h2::server::Builder::new()
        .initial_window_size(INITIAL_WINDOW_SIZE)
        .initial_connection_window_size(INITIAL_CONNECTION_WINDOW_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .max_concurrent_streams(MAX_CONCURRENT_STREAMS)
        .handshake::<_, Bytes>(stream)
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            debug!(peer = %peer, error = %e, "HTTP/2 handshake failed");
            return;
        }
    };
    debug!(peer = %peer, "HTTP/2 connection established");

    let active = Arc::new(AtomicUsize::new(0));
    let mut draining = false;
    loop {
        let event = if draining {
            if active.load(Ordering::Acquire) == 0 {
                break;
            }
            conn.accept().await
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    draining = true;
                    continue;
                }
                event = conn.accept() => event,
            }
        };

        match event {
            Some(Ok((request, mut respond))) => {
                if draining {
                    // dropping the responder resets the exchange
                    continue;
                }
                let response = http::Response::builder()
                    .status(http::StatusCode::OK)
                    .body(())
                    .unwrap();
                let send = match respond.send_response(response, false) {
                    Ok(send) => send,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to open response stream");
                        continue;
                    }
                };

                let exchange =
                    ExchangeStream::with_tracker(request.into_body(), send, Arc::clone(&active));
                let accepted = Accepted {
                    stream: Box::pin(exchange),
                    meta: ConnectionMeta {
                        peer_addr: peer,
                        local_addr,
                        network: Network::Tcp,
                    },
                };
                match queue.try_send(accepted) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        warn!(peer = %peer, "connection queue is full, client discarded");
                        drop(dropped);
                    }
                    Err(TrySendError::Closed(dropped)) => {
                        drop(dropped);
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                debug!(peer = %peer, error = %e, "HTTP/2 connection error");
                break;
            }
            None => {
                debug!(peer = %peer, "HTTP/2 connection closed");
                break;
            }
        }
    }
}
