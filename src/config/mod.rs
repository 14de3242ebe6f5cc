//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RuntimeConfig (validated, immutable)
//!     → lifecycle::RuntimeBuilder::from_config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AuthConfig, DebugConfig, GatewayConfig, HealthConfig, HttpApiConfig, ListenerConfig,
    LogFormat, MuxSettings, ObservabilityConfig, RpcConfig, RuntimeConfig, TimeoutConfig,
    TlsConfig,
};
pub use validation::{validate_config, ValidationError};
