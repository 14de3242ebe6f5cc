//! Connection multiplexer.
//!
//! # Data Flow
//! ```text
//! TCP accept (root node, permit acquired)
//!     → sniff.rs reads a prefix, matcher.rs probes in registration order
//!     → first match: prefix rewound, connection queued on that branch
//!     → no match / timeout: connection closed
//!
//! Secure deployment:
//!     root ─ tls ──→ TLS node (handshake) ─┬─ http1 → gateway
//!                                          └─ any   → RPC server
//! ```
//!
//! # Design Decisions
//! - Nodes live in an arena, nesting is a node fed by a parent branch
//! - Closing a node drops its branch senders, closing every listener below it
//! - One bad connection never stops an accept loop

pub mod listener;
pub mod matcher;
pub mod sniff;
pub mod tree;

use std::time::Duration;

pub use listener::{ConnInfo, Io, MuxConn, TlsInfo, VirtualListener};
pub use matcher::{Any, Http1Fast, Http2Preface, MatchResult, Matcher, Prefix, TlsHandshake};
pub use tree::{ListenerTree, NodeId};

use crate::net::ListenerError;

/// Tuning for classification and hand-off.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Upper bound on reading the classification prefix and on TLS handshakes.
    pub peek_timeout: Duration,
    /// Classification gives up after this many bytes.
    pub max_peek_bytes: usize,
    /// Depth of each virtual listener's accept queue.
    pub accept_queue: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            peek_timeout: Duration::from_secs(10),
            max_peek_bytes: 4096,
            accept_queue: 128,
        }
    }
}

/// Errors surfaced by the multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The node feeding this virtual listener has stopped.
    #[error("listener closed")]
    ListenerClosed,
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("no mux node with index {0}")]
    UnknownNode(usize),
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
}
