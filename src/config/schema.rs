//! Configuration schema definitions.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration that serves plaintext RPC on `0.0.0.0:9000`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Root configuration for the runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Service name used in logs and authorization requests.
    pub name: String,

    /// Shared listener for RPC and the gateway.
    pub listener: ListenerConfig,

    /// Connection classification.
    pub mux: MuxSettings,

    pub rpc: RpcConfig,

    /// HTTP/1.1 gateway on the shared listener.
    pub gateway: GatewayConfig,

    /// Standalone HTTP API server.
    pub http: HttpApiConfig,

    pub health: HealthConfig,

    pub debug: DebugConfig,

    pub auth: AuthConfig,

    pub timeouts: TimeoutConfig,

    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9000").
    pub bind_address: String,

    /// TLS for the shared listener and the HTTP API server.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: String,

    /// Path to private key (PEM).
    pub key_path: String,

    /// CA bundle (PEM). When set, clients must present a certificate it signed.
    pub client_ca_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MuxSettings {
    /// Time allowed for the first bytes (and the TLS handshake) to arrive.
    pub peek_timeout_ms: u64,

    /// Bytes read before giving up on classification.
    pub max_peek_bytes: usize,

    /// Classified connections buffered per branch.
    pub accept_queue: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            peek_timeout_ms: 10_000,
            max_peek_bytes: 4096,
            accept_queue: 128,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,
    pub max_message_size: usize,

    /// Seconds without traffic before the server pings. 0 disables pings.
    pub keepalive_interval_secs: u64,

    /// Seconds to wait for the ping ack before closing the connection.
    pub keepalive_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_message_size: 4 * 1024 * 1024,
            keepalive_interval_secs: 60,
            keepalive_timeout_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpApiConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub bind_address: String,

    /// Seconds between rounds while healthy.
    pub success_interval_secs: u64,

    /// Seconds between rounds while failing.
    pub failure_interval_secs: u64,

    pub probe_timeout_secs: u64,

    /// Failed rounds tolerated before liveness fails.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8081".to_string(),
            success_interval_secs: 5,
            failure_interval_secs: 2,
            probe_timeout_secs: 2,
            failure_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
    pub bind_address: String,

    /// Labels shown on `/info`.
    pub tags: BTreeMap<String, String>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:6060".to_string(),
            tags: BTreeMap::new(),
        }
    }
}

/// Token verification and authorization settings. The verifier and the
/// authorizer themselves are supplied in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,

    /// Expected `iss`; must be an absolute URL.
    pub issuer: String,

    /// Expected `aud` entry.
    pub audience: Option<String>,

    /// Clock skew tolerated on `exp`.
    pub leeway_secs: u64,

    /// Claims that must be present with these exact values.
    pub required_claims: HashMap<String, String>,

    /// Members of this group get `admin_role`.
    pub admin_group: Option<String>,
    pub admin_role: Option<String>,

    /// Application name sent to the authorizer.
    pub app_name: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// HTTP request timeout.
    pub request_secs: u64,

    /// Upper bound for each shutdown phase.
    pub shutdown_phase_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            shutdown_phase_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or filter directive (e.g. "info,svcmux=debug").
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
