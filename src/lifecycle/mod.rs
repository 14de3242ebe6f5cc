//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     RuntimeConfig / builder calls → RuntimeBuilder::build → Runtime
//!
//! Run (runtime.rs):
//!     Runtime::start → bind all listeners → spawn servers
//!                    → error channel (task exits, signals)
//!
//! Shutdown (runtime.rs, shutdown.rs):
//!     Runtime::stop → phases in fixed order, each with a timeout
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → reported on the error channel
//! ```
//!
//! # Design Decisions
//! - Bind everything before spawning anything
//! - Ordered shutdown: API handlers, RPC, HTTP, health, debug, daemon, hook, telemetry
//! - A failed phase never blocks the phases after it

pub mod runtime;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use runtime::{
    BoundAddrs, Daemon, RpcApi, Runtime, RuntimeError, ShutdownHook, ShutdownReport,
    ERROR_CHANNEL_DEPTH,
};
pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
pub use startup::{RuntimeBuilder, StartupError};
