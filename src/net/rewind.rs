//! Replay buffer for sniffed connection prefixes.
//!
//! Protocol classification has to read the first bytes of a stream. Those
//! bytes are kept here and handed back, in order, to whichever protocol
//! server ends up owning the connection.

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream wrapper that replays a buffered prefix before reading from `inner`.
#[derive(Debug)]
pub struct Rewind<S> {
    inner: S,
    prefix: Bytes,
}

impl<S> Rewind<S> {
    /// Wrap `inner` with nothing to replay.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            prefix: Bytes::new(),
        }
    }

    /// Wrap `inner`, replaying `prefix` first.
    pub fn with_prefix(inner: S, prefix: Bytes) -> Self {
        Self { inner, prefix }
    }

    /// Bytes that have not been replayed yet.
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }

    /// Push `buffered` in front of whatever is still pending.
    pub fn rewind(&mut self, buffered: Bytes) {
        if self.prefix.is_empty() {
            self.prefix = buffered;
        } else {
            let mut joined = Vec::with_capacity(buffered.len() + self.prefix.len());
            joined.extend_from_slice(&buffered);
            joined.extend_from_slice(&self.prefix);
            self.prefix = Bytes::from(joined);
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Split into the inner stream and the unreplayed prefix.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.prefix)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
