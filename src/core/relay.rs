//! Bidirectional relay
//!
//! Full-duplex byte copying between two streams with per-direction byte
//! counters. The counters live outside the copy so totals are available
//! even when the copy ends in an error.

use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bytes transferred in each direction
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyResult {
    /// Bytes transferred from A to B
    pub a_to_b: u64,
    /// Bytes transferred from B to A
    pub b_to_a: u64,
}

pin_project! {
    /// Stream wrapper that counts bytes read from the inner stream
    struct CountingStream<S> {
        #[pin]
        inner: S,
        read_bytes: Arc<AtomicU64>,
    }
}

impl<S> CountingStream<S> {
    fn new(inner: S, read_bytes: Arc<AtomicU64>) -> Self {
        Self { inner, read_bytes }
    }
}

impl<S: AsyncRead> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before_len = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes_read = buf.filled().len() - before_len;
            if bytes_read > 0 {
                this.read_bytes.fetch_add(bytes_read as u64, Ordering::Relaxed);
            }
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Copy bytes in both directions until either side closes or errors.
///
/// Blocks for the lifetime of the session; there is no timeout here. Both
/// streams are consumed and therefore closed when the copy returns. The
/// byte counts are valid on the error path too.
pub async fn copy_duplex<A, B>(a: A, b: B) -> (std::io::Result<()>, CopyResult)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    // Reads from A are bytes travelling A -> B, and vice versa
    let mut counted_a = CountingStream::new(a, Arc::clone(&a_to_b));
    let mut counted_b = CountingStream::new(b, Arc::clone(&b_to_a));

    let result = tokio::io::copy_bidirectional(&mut counted_a, &mut counted_b)
        .await
        .map(|_| ());

    (
        result,
        CopyResult {
            a_to_b: a_to_b.load(Ordering::Relaxed),
            b_to_a: b_to_a.load(Ordering::Relaxed),
        },
    )
}
