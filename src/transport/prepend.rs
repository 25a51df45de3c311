//! Stream wrapper that replays already-read bytes
//!
//! Protocol sniffing (e.g. the PROXY header check) may consume bytes that
//! turn out to belong to the application stream; this wrapper hands them
//! back to the reader before continuing with the inner stream.

use bytes::Bytes;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pin_project! {
    pub struct PrependStream<S> {
        #[pin]
        inner: S,
        prefix: Bytes,
        offset: usize,
    }
}

impl<S> PrependStream<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self {
            inner,
            prefix,
            offset: 0,
        }
    }
}

impl<S: AsyncRead> AsyncRead for PrependStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.offset < this.prefix.len() {
            let remaining = &this.prefix[*this.offset..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            *this.offset += to_copy;
            if *this.offset >= this.prefix.len() {
                *this.prefix = Bytes::new();
                *this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrependStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_read_before_inner() {
        let inner = Cursor::new(b"world".to_vec());
        let mut stream = PrependStream::new(inner, Bytes::from_static(b"hello "));

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_prefix_served_across_small_reads() {
        let inner = Cursor::new(b"xyz".to_vec());
        let mut stream = PrependStream::new(inner, Bytes::from_static(b"abcd"));

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cd");
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xy");
    }

    #[tokio::test]
    async fn test_empty_prefix_is_passthrough() {
        let inner = Cursor::new(b"data".to_vec());
        let mut stream = PrependStream::new(inner, Bytes::new());

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "data");
    }

    #[tokio::test]
    async fn test_writes_bypass_prefix() {
        let inner = Cursor::new(Vec::new());
        let mut stream = PrependStream::new(inner, Bytes::from_static(b"unread"));

        stream.write_all(b"written").await.unwrap();
        stream.flush().await.unwrap();
    }
}
