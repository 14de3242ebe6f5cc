//! Listener tree: the root socket plus nested TLS-terminating nodes.
//!
//! Nodes live in an arena addressed by [`NodeId`]. Node 0 owns the TCP
//! socket; every other node is fed by a virtual listener of its parent and
//! terminates TLS before classifying again.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::listener::{ConnInfo, MuxConn, TlsInfo, VirtualListener};
use super::matcher::Matcher;
use super::sniff;
use super::{MuxConfig, MuxError};
use crate::net::{ConnectionId, Listener};

/// Index of a node in a [`ListenerTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// The node bound to the TCP socket.
    pub const ROOT: NodeId = NodeId(0);
}

enum Source {
    Tcp(Listener),
    Tls {
        upstream: VirtualListener,
        acceptor: TlsAcceptor,
    },
}

struct Branch {
    matcher: Arc<dyn Matcher>,
    tx: mpsc::Sender<MuxConn>,
}

struct Node {
    name: String,
    source: Source,
    branches: Vec<Branch>,
}

/// Everything a connection task needs from its node.
struct NodeCtx {
    name: String,
    branches: Vec<Branch>,
    config: MuxConfig,
}

/// A tree of multiplexers sharing one listening socket.
pub struct ListenerTree {
    nodes: Vec<Node>,
    config: MuxConfig,
    local_addr: SocketAddr,
}

impl ListenerTree {
    /// Create a tree whose root accepts from `listener`.
    pub fn new(listener: Listener, config: MuxConfig) -> Result<Self, MuxError> {
        let local_addr = listener.local_addr().map_err(MuxError::Io)?;
        Ok(Self {
            nodes: vec![Node {
                name: "root".to_string(),
                source: Source::Tcp(listener),
                branches: Vec::new(),
            }],
            config,
            local_addr,
        })
    }

    /// Bind `addr` and create a tree over it.
    pub async fn bind(addr: &str, max_connections: usize, config: MuxConfig) -> Result<Self, MuxError> {
        let listener = Listener::bind(addr, max_connections).await?;
        Self::new(listener, config)
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a branch on `node`. Branches are probed in registration order.
    pub fn route<M>(&mut self, node: NodeId, matcher: M) -> Result<VirtualListener, MuxError>
    where
        M: Matcher + 'static,
    {
        let local_addr = self.local_addr;
        let depth = self.config.accept_queue;
        let entry = self
            .nodes
            .get_mut(node.0)
            .ok_or(MuxError::UnknownNode(node.0))?;
        let (tx, rx) = mpsc::channel(depth);
        let name = format!("{}/{}", entry.name, matcher.name());
        entry.branches.push(Branch {
            matcher: Arc::new(matcher),
            tx,
        });
        tracing::debug!(branch = %name, priority = entry.branches.len() - 1, "Mux branch registered");
        Ok(VirtualListener::new(name, local_addr, rx))
    }

    /// Feed `upstream` into a new node that terminates TLS and classifies the
    /// decrypted stream.
    pub fn terminate_tls(&mut self, upstream: VirtualListener, acceptor: TlsAcceptor) -> NodeId {
        let id = NodeId(self.nodes.len());
        let name = if id.0 == 1 {
            "tls".to_string()
        } else {
            format!("tls{}", id.0)
        };
        self.nodes.push(Node {
            name,
            source: Source::Tls { upstream, acceptor },
            branches: Vec::new(),
        });
        id
    }

    /// Run every node's accept loop until `shutdown` fires or the root
    /// socket fails.
    ///
    /// On return every virtual listener of the tree has been closed.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), MuxError> {
        let config = self.config;
        let mut nested = JoinSet::new();
        let mut root = None;

        for node in self.nodes {
            let ctx = Arc::new(NodeCtx {
                name: node.name,
                branches: node.branches,
                config: config.clone(),
            });
            match node.source {
                Source::Tcp(listener) => root = Some((listener, ctx)),
                Source::Tls { upstream, acceptor } => {
                    nested.spawn(tls_loop(upstream, acceptor, ctx, shutdown.clone()));
                }
            }
        }

        let result = match root {
            Some((listener, ctx)) => root_loop(listener, ctx, shutdown.clone()).await,
            None => Ok(()),
        };

        // Root branches are gone, so nested upstreams now report closed.
        while nested.join_next().await.is_some() {}
        result
    }
}

async fn root_loop(
    listener: Listener,
    ctx: Arc<NodeCtx>,
    shutdown: CancellationToken,
) -> Result<(), MuxError> {
    let local_addr = listener.local_addr().map_err(MuxError::Io)?;
    tracing::info!(address = %local_addr, branches = ctx.branches.len(), "Mux accept loop started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(node = %ctx.name, "Mux accept loop stopping");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr, permit) = match accepted {
            Ok(conn) => conn,
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Transient accept error");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Mux accept loop failed");
                return Err(e.into());
            }
        };

        let _ = stream.set_nodelay(true);
        let info = ConnInfo {
            id: ConnectionId::new(),
            peer_addr,
            local_addr,
            tls: None,
            branch: ctx.name.clone(),
        };
        let conn = MuxConn::new(Box::new(stream), info, Some(permit));
        tokio::spawn(guarded(dispatch(ctx.clone(), conn), shutdown.clone()));
    }
}

async fn tls_loop(
    mut upstream: VirtualListener,
    acceptor: TlsAcceptor,
    ctx: Arc<NodeCtx>,
    shutdown: CancellationToken,
) {
    tracing::debug!(node = %ctx.name, source = %upstream.name(), "TLS node started");
    loop {
        let conn = tokio::select! {
            _ = shutdown.cancelled() => break,
            conn = upstream.accept() => match conn {
                Ok(conn) => conn,
                Err(_) => break,
            },
        };
        let handshake = handshake(acceptor.clone(), conn, ctx.clone());
        tokio::spawn(guarded(handshake, shutdown.clone()));
    }
    tracing::debug!(node = %ctx.name, "TLS node stopped");
}

async fn guarded<F>(work: F, shutdown: CancellationToken)
where
    F: std::future::Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = work => {}
    }
}

async fn handshake(acceptor: TlsAcceptor, conn: MuxConn, ctx: Arc<NodeCtx>) {
    let mut info = conn.info().clone();
    let accepted = tokio::time::timeout(ctx.config.peek_timeout, acceptor.accept(conn)).await;
    let stream = match accepted {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %info.id, peer_addr = %info.peer_addr, error = %e, "TLS handshake failed");
            reject(&ctx, "handshake");
            return;
        }
        Err(_) => {
            tracing::debug!(connection_id = %info.id, peer_addr = %info.peer_addr, "TLS handshake timed out");
            reject(&ctx, "handshake_timeout");
            return;
        }
    };

    let (_, session) = stream.get_ref();
    info.tls = Some(TlsInfo {
        alpn: session.alpn_protocol().map(<[u8]>::to_vec),
        server_name: session.server_name().map(str::to_string),
        peer_certificates: session
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
            .unwrap_or_default(),
    });
    info.branch = ctx.name.clone();

    // The outer connection, and with it the root permit, lives inside the TLS stream.
    let conn = MuxConn::new(Box::new(stream), info, None);
    dispatch(ctx, conn).await;
}

async fn dispatch(ctx: Arc<NodeCtx>, mut conn: MuxConn) {
    let matchers: Vec<&dyn Matcher> = ctx.branches.iter().map(|b| b.matcher.as_ref()).collect();
    let classified = tokio::time::timeout(
        ctx.config.peek_timeout,
        sniff::classify(&mut conn, &matchers, ctx.config.max_peek_bytes),
    )
    .await;

    let (decision, prefix) = match classified {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %conn.info().id, error = %e, "Read failed during classification");
            reject(&ctx, "read_error");
            return;
        }
        Err(_) => {
            tracing::debug!(connection_id = %conn.info().id, peer_addr = %conn.info().peer_addr, "Classification timed out");
            reject(&ctx, "peek_timeout");
            return;
        }
    };

    let Some(branch) = decision.and_then(|index| ctx.branches.get(index)) else {
        tracing::debug!(
            connection_id = %conn.info().id,
            peer_addr = %conn.info().peer_addr,
            peeked = prefix.len(),
            "No matcher claimed connection"
        );
        reject(&ctx, "unmatched");
        return;
    };

    conn.rewind(prefix.freeze());
    conn.info_mut().branch = format!("{}/{}", ctx.name, branch.matcher.name());

    metrics::counter!(
        "mux_connections_total",
        "node" => ctx.name.clone(),
        "branch" => branch.matcher.name().to_string()
    )
    .increment(1);
    tracing::trace!(connection_id = %conn.info().id, branch = %conn.info().branch, "Connection classified");

    if let Err(mpsc::error::SendError(conn)) = branch.tx.send(conn).await {
        tracing::debug!(connection_id = %conn.info().id, "Branch listener closed, dropping connection");
        reject(&ctx, "queue_closed");
    }
}

fn reject(ctx: &NodeCtx, reason: &'static str) {
    metrics::counter!("mux_rejected_total", "node" => ctx.name.clone(), "reason" => reason).increment(1);
}
