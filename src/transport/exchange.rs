//! HTTP/2 exchange as a byte stream
//!
//! Adapts one server-side HTTP/2 exchange into a full-duplex transport
//! stream: reads consume the request body, writes produce the response body.
//! The bodies carry opaque bytes; nothing is framed or interpreted.

use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Largest chunk handed to the HTTP/2 send stream in one write
const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// One HTTP/2 exchange viewed as a transport stream.
///
/// Completion is signalled exactly once through the done token, whether the
/// stream is shut down by its consumer or dropped by the listener's cleanup;
/// whichever happens first wins and later calls are no-ops.
pub struct ExchangeStream {
    recv: RecvStream,
    send: SendStream<Bytes>,
    leftover: Bytes,
    leftover_pos: usize,
    pending_release: usize,
    done: CancellationToken,
    read_closed: bool,
    write_closed: bool,
    tracker: Option<Arc<AtomicUsize>>,
}

impl ExchangeStream {
    pub fn new(recv: RecvStream, send: SendStream<Bytes>) -> Self {
        Self {
            recv,
            send,
            leftover: Bytes::new(),
            leftover_pos: 0,
            pending_release: 0,
            done: CancellationToken::new(),
            read_closed: false,
            write_closed: false,
            tracker: None,
        }
    }

    /// Attach a shared counter of live exchanges; incremented here,
    /// decremented on drop.
    pub fn with_tracker(recv: RecvStream, send: SendStream<Bytes>, tracker: Arc<AtomicUsize>) -> Self {
        tracker.fetch_add(1, Ordering::AcqRel);
        let mut stream = Self::new(recv, send);
        stream.tracker = Some(tracker);
        stream
    }

    /// Token cancelled exactly once when the exchange completes
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// End the response stream if still open. Idempotent.
    fn finalize(&mut self) {
        if !self.write_closed {
            self.write_closed = true;
            // A failure here means the peer is already gone; the reset
            // the peer observes carries the same meaning as end-of-stream.
            let _ = self.send.send_data(Bytes::new(), true);
        }
        self.done.cancel();
    }

    fn release_consumed(&mut self, consumed: usize) {
        let to_release = self.pending_release.min(consumed);
        if to_release > 0 {
            if let Err(e) = self.recv.flow_control().release_capacity(to_release) {
                warn!(error = %e, to_release, "Failed to release HTTP/2 flow control capacity");
            }
            self.pending_release -= to_release;
        }
    }
}

fn is_normal_stream_close(error: &h2::Error) -> bool {
    if let Some(reason) = error.reason() {
        matches!(reason, Reason::NO_ERROR | Reason::CANCEL)
    } else {
        false
    }
}

impl AsyncRead for ExchangeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_closed {
            return Poll::Ready(Ok(()));
        }

        if self.leftover_pos < self.leftover.len() {
            let remaining = self.leftover.len() - self.leftover_pos;
            let to_copy = remaining.min(buf.remaining());
            let start = self.leftover_pos;
            buf.put_slice(&self.leftover.slice(start..start + to_copy));
            self.leftover_pos += to_copy;
            if self.leftover_pos >= self.leftover.len() {
                self.leftover = Bytes::new();
                self.leftover_pos = 0;
            }
            self.release_consumed(to_copy);
            return Poll::Ready(Ok(()));
        }

        loop {
            match self.recv.poll_data(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.pending_release += chunk.len();
                    let to_copy = chunk.len().min(buf.remaining());
                    buf.put_slice(&chunk[..to_copy]);
                    if to_copy < chunk.len() {
                        self.leftover = chunk.slice(to_copy..);
                        self.leftover_pos = 0;
                    }
                    self.release_consumed(to_copy);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.read_closed = true;
                    if is_normal_stream_close(&e) {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::other(format!("h2 recv error: {}", e))));
                }
                Poll::Ready(None) => {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ExchangeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "exchange closed",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        loop {
            let capacity = self.send.capacity();
            if capacity > 0 {
                let n = capacity.min(buf.len()).min(MAX_WRITE_CHUNK);
                return match self.send.send_data(Bytes::copy_from_slice(&buf[..n]), false) {
                    Ok(()) => Poll::Ready(Ok(n)),
                    Err(e) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        format!("h2 send error: {}", e),
                    ))),
                };
            }

            self.send
                .reserve_capacity(buf.len().min(MAX_WRITE_CHUNK));
            match self.send.poll_capacity(cx) {
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::other(format!(
                        "h2 capacity error: {}",
                        e
                    ))));
                }
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "h2 stream closed",
                    )));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Data frames are handed to the connection task on send; there is
        // no intermediate buffer to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.finalize();
        Poll::Ready(Ok(()))
    }
}

impl Drop for ExchangeStream {
    fn drop(&mut self) {
        self.finalize();
        if let Some(tracker) = self.tracker.take() {
            tracker.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
