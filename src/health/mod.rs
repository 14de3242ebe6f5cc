//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Poll loop (service.rs)
//!     → Run every registered probe (probe.rs)
//!     → Count consecutive failed rounds
//!     → /ready fails on any failed round, /live past the threshold
//! ```

pub mod probe;
pub mod service;

pub use probe::Probe;
pub use service::{HealthService, HealthSettings};
