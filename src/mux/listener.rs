//! Virtual listeners and the connections they hand out.

use bytes::Bytes;
use rustls::pki_types::CertificateDer;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::MuxError;
use crate::net::{ConnectionId, ConnectionPermit, Rewind};

/// Any byte stream the mux can carry.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Details of a terminated TLS session.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    /// Negotiated ALPN protocol.
    pub alpn: Option<Vec<u8>>,
    /// SNI sent by the client.
    pub server_name: Option<String>,
    /// Client certificate chain, leaf first. Empty without mTLS.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// Where a connection came from and how it was classified.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub tls: Option<TlsInfo>,
    /// Classification path, e.g. `root/tls` then `tls/http1`.
    pub branch: String,
}

impl ConnInfo {
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

/// A classified connection.
///
/// Reads replay the bytes consumed during classification before touching
/// the socket again.
pub struct MuxConn {
    io: Rewind<Box<dyn Io>>,
    info: ConnInfo,
    permit: Option<ConnectionPermit>,
}

impl std::fmt::Debug for MuxConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConn")
            .field("info", &self.info)
            .field("pending", &self.io.pending().len())
            .finish()
    }
}

impl MuxConn {
    pub fn new(io: Box<dyn Io>, info: ConnInfo, permit: Option<ConnectionPermit>) -> Self {
        Self {
            io: Rewind::new(io),
            info,
            permit,
        }
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub(crate) fn info_mut(&mut self) -> &mut ConnInfo {
        &mut self.info
    }

    /// Queue `prefix` to be read again before anything else.
    pub(crate) fn rewind(&mut self, prefix: Bytes) {
        self.io.rewind(prefix);
    }

    /// Bytes still waiting to be replayed.
    pub fn pending(&self) -> &[u8] {
        self.io.pending()
    }

    pub fn has_permit(&self) -> bool {
        self.permit.is_some()
    }
}

impl AsyncRead for MuxConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// The accept side of one branch of a listener tree.
///
/// Consumed by exactly one protocol server or nested TLS node. Once the
/// owning node stops, `accept` fails with [`MuxError::ListenerClosed`].
#[derive(Debug)]
pub struct VirtualListener {
    name: String,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<MuxConn>,
}

impl VirtualListener {
    pub(crate) fn new(name: String, local_addr: SocketAddr, rx: mpsc::Receiver<MuxConn>) -> Self {
        Self {
            name,
            local_addr,
            rx,
        }
    }

    /// Wait for the next connection routed to this branch.
    pub async fn accept(&mut self) -> Result<MuxConn, MuxError> {
        self.rx.recv().await.ok_or(MuxError::ListenerClosed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the physical socket underneath.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Queued connections are dropped.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
