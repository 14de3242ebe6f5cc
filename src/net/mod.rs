//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits)
//!     → mux (classification over a rewind.rs replay buffer)
//!     → tls.rs (optional TLS handshake, nested classification)
//!     → connection.rs (tracking inside the protocol server)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Sniffed bytes are replayed, never dropped
//! - Each served connection is tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod rewind;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use rewind::Rewind;
pub use tls::{ServerTls, TlsError};
