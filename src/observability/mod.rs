//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (logging.rs installs the subscriber)
//!     → metrics facade calls (metrics.rs installs the exporter)
//!
//! Consumers:
//!     → stdout, pretty or JSON
//!     → Prometheus scrape endpoint
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LoggingError};
pub use metrics::{start_exporter, MetricsError, MetricsExporter};
