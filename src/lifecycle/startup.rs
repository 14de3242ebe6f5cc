//! Startup orchestration.
//!
//! # Responsibilities
//! - Collect servers, APIs and collaborators through [`RuntimeBuilder`]
//! - Translate a loaded [`RuntimeConfig`] into builder settings
//! - Reject incomplete setups before anything binds
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - TLS material is loaded and the acceptor built exactly once
//! - Listeners bind in [`Runtime::start`], after every check here passed

use axum::Router;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::runtime::{Daemon, RpcApi, Runtime, RuntimeSettings, ShutdownHook};
use crate::auth::{AuthError, AuthRuntime, AuthServiceBuilder, BoxError};
use crate::config::RuntimeConfig;
use crate::health::{HealthService, HealthSettings, Probe};
use crate::http::HttpServer;
use crate::mux::{MuxConfig, MuxError};
use crate::net::{ServerTls, TlsError};
use crate::observability::MetricsError;
use crate::rpc::{KeepAlive, RegistryError, RpcServer, StreamInterceptor, UnaryInterceptor};

/// Errors raised while assembling or starting a [`Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("RPC registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("auth setup failed: {0}")]
    Auth(#[from] AuthError),

    #[error("RPC is enabled but no API handlers were registered")]
    NoRpcApis,

    #[error("gateway is enabled but no API provides gateway routes")]
    NoGatewayRoutes,

    #[error("HTTP server is enabled but no handler was set")]
    MissingHttpHandler,

    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("failed to bind {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("runtime already started")]
    AlreadyStarted,

    #[error("telemetry setup failed: {0}")]
    Telemetry(#[source] MetricsError),
}

/// Assembles a [`Runtime`].
pub struct RuntimeBuilder {
    name: String,
    bind_address: String,
    max_connections: usize,
    tls: Option<ServerTls>,
    mux: MuxConfig,
    rpc_enabled: bool,
    max_message_size: usize,
    keep_alive: KeepAlive,
    gateway_enabled: bool,
    gateway_routes: Vec<Router>,
    http_handler: Option<Router>,
    http_address: Option<String>,
    health_address: String,
    health_settings: HealthSettings,
    probes: Vec<(String, Arc<dyn Probe>)>,
    debug_address: Option<String>,
    tags: BTreeMap<String, String>,
    auth: Option<Arc<dyn AuthRuntime>>,
    auth_builder: Option<AuthServiceBuilder>,
    apis: Vec<Arc<dyn RpcApi>>,
    unary_interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    stream_interceptors: Vec<Arc<dyn StreamInterceptor>>,
    daemon: Option<Arc<dyn Daemon>>,
    shutdown_hook: Option<ShutdownHook>,
    request_timeout: Duration,
    phase_timeout: Duration,
    metrics_address: Option<SocketAddr>,
    handle_signals: bool,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            name: "svcmux".to_string(),
            bind_address: "0.0.0.0:9000".to_string(),
            max_connections: 10_000,
            tls: None,
            mux: MuxConfig::default(),
            rpc_enabled: true,
            max_message_size: 4 * 1024 * 1024,
            keep_alive: KeepAlive::default(),
            gateway_enabled: false,
            gateway_routes: Vec::new(),
            http_handler: None,
            http_address: None,
            health_address: "0.0.0.0:8081".to_string(),
            health_settings: HealthSettings::default(),
            probes: Vec::new(),
            debug_address: None,
            tags: BTreeMap::new(),
            auth: None,
            auth_builder: None,
            apis: Vec::new(),
            unary_interceptors: Vec::new(),
            stream_interceptors: Vec::new(),
            daemon: None,
            shutdown_hook: None,
            request_timeout: Duration::from_secs(30),
            phase_timeout: Duration::from_secs(30),
            metrics_address: None,
            handle_signals: true,
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings from a validated configuration file.
    ///
    /// TLS files are read here. When `auth.enabled` is set, the token
    /// verifier must still be supplied with [`configure_auth`].
    ///
    /// [`configure_auth`]: RuntimeBuilder::configure_auth
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, StartupError> {
        let mut builder = Self::new()
            .bind_address(&config.listener.bind_address)
            .max_connections(config.listener.max_connections)
            .mux(MuxConfig {
                peek_timeout: Duration::from_millis(config.mux.peek_timeout_ms),
                max_peek_bytes: config.mux.max_peek_bytes,
                accept_queue: config.mux.accept_queue,
            })
            .rpc(config.rpc.enabled)
            .max_message_size(config.rpc.max_message_size)
            .rpc_keep_alive(KeepAlive {
                interval: (config.rpc.keepalive_interval_secs > 0)
                    .then(|| Duration::from_secs(config.rpc.keepalive_interval_secs)),
                timeout: Duration::from_secs(config.rpc.keepalive_timeout_secs),
            })
            .gateway(config.gateway.enabled)
            .health_address(&config.health.bind_address)
            .health_settings(HealthSettings {
                success_interval: Duration::from_secs(config.health.success_interval_secs),
                failure_interval: Duration::from_secs(config.health.failure_interval_secs),
                probe_timeout: Duration::from_secs(config.health.probe_timeout_secs),
                failure_threshold: config.health.failure_threshold,
            })
            .tags(config.debug.tags.clone())
            .request_timeout(Duration::from_secs(config.timeouts.request_secs))
            .phase_timeout(Duration::from_secs(config.timeouts.shutdown_phase_secs));

        if !config.name.is_empty() {
            builder = builder.name(&config.name);
        }
        if config.http.enabled {
            builder = builder.http_address(&config.http.bind_address);
        }
        if config.debug.enabled {
            builder = builder.debug(&config.debug.bind_address);
        }

        if let Some(tls) = &config.listener.tls {
            let server_tls = ServerTls::from_files(
                Path::new(&tls.cert_path),
                Path::new(&tls.key_path),
                tls.client_ca_path.as_deref().map(Path::new),
            )?;
            builder = builder.tls(server_tls);
        }

        if config.observability.metrics_enabled {
            let addr = config
                .observability
                .metrics_address
                .parse()
                .map_err(|_| StartupError::InvalidAddress {
                    field: "observability.metrics_address",
                    value: config.observability.metrics_address.clone(),
                })?;
            builder = builder.metrics_address(addr);
        }

        if config.auth.enabled {
            let auth = &config.auth;
            let app_name = if auth.app_name.is_empty() {
                builder.name.clone()
            } else {
                auth.app_name.clone()
            };
            let mut service = AuthServiceBuilder::default()
                .app_name(app_name)
                .service_name(builder.name.clone())
                .issuer(&auth.issuer)
                .required_claims(auth.required_claims.clone())
                .leeway(Duration::from_secs(auth.leeway_secs));
            if let Some(audience) = &auth.audience {
                service = service.audience(audience);
            }
            if let (Some(group), Some(role)) = (&auth.admin_group, &auth.admin_role) {
                service = service.admin_group_role(group, role);
            }
            builder.auth_builder = Some(service);
        }

        Ok(builder)
    }

    /// Service name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Address of the shared RPC/gateway listener.
    pub fn bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Serve TLS on the shared listener and the HTTP API server.
    pub fn tls(mut self, tls: ServerTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn mux(mut self, config: MuxConfig) -> Self {
        self.mux = config;
        self
    }

    pub fn rpc(mut self, enabled: bool) -> Self {
        self.rpc_enabled = enabled;
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Ping idle RPC connections and close those that stop answering.
    pub fn rpc_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Route HTTP/1.1 traffic on the shared listener to the gateway.
    pub fn gateway(mut self, enabled: bool) -> Self {
        self.gateway_enabled = enabled;
        self
    }

    /// Extra gateway routes, merged with those the APIs provide. Enables
    /// the gateway.
    pub fn gateway_routes(mut self, routes: Router) -> Self {
        self.gateway_enabled = true;
        self.gateway_routes.push(routes);
        self
    }

    /// Router for the standalone HTTP API server.
    pub fn http_handler(mut self, router: Router) -> Self {
        self.http_handler = Some(router);
        self
    }

    /// Enables the standalone HTTP API server on `addr`.
    pub fn http_address(mut self, addr: impl Into<String>) -> Self {
        self.http_address = Some(addr.into());
        self
    }

    pub fn health_address(mut self, addr: impl Into<String>) -> Self {
        self.health_address = addr.into();
        self
    }

    pub fn health_settings(mut self, settings: HealthSettings) -> Self {
        self.health_settings = settings;
        self
    }

    /// Register a named probe polled by the health service.
    pub fn probe(mut self, name: impl Into<String>, probe: Arc<dyn Probe>) -> Self {
        self.probes.push((name.into(), probe));
        self
    }

    /// Serve the debug endpoints on `addr`.
    pub fn debug(mut self, addr: impl Into<String>) -> Self {
        self.debug_address = Some(addr.into());
        self
    }

    /// Labels shown by the debug `/info` page.
    pub fn tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Use a ready-made auth runtime. Takes precedence over
    /// [`configure_auth`](RuntimeBuilder::configure_auth).
    pub fn auth(mut self, runtime: Arc<dyn AuthRuntime>) -> Self {
        self.auth = Some(runtime);
        self
    }

    /// Adjust the [`AuthServiceBuilder`] prepared from configuration, or
    /// start a fresh one.
    pub fn configure_auth<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(AuthServiceBuilder) -> AuthServiceBuilder,
    {
        let builder = self.auth_builder.take().unwrap_or_default();
        self.auth_builder = Some(configure(builder));
        self
    }

    /// Register an API. Its services join the RPC server and its gateway
    /// routes, if any, join the gateway.
    pub fn api(mut self, api: Arc<dyn RpcApi>) -> Self {
        self.apis.push(api);
        self
    }

    /// Runs after the built-in logging and auth interceptors.
    pub fn unary_interceptor(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Self {
        self.unary_interceptors.push(interceptor);
        self
    }

    pub fn stream_interceptor(mut self, interceptor: Arc<dyn StreamInterceptor>) -> Self {
        self.stream_interceptors.push(interceptor);
        self
    }

    pub fn daemon(mut self, daemon: Arc<dyn Daemon>) -> Self {
        self.daemon = Some(daemon);
        self
    }

    /// Run `hook` once during shutdown, after the daemon stopped.
    pub fn shutdown_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.shutdown_hook = Some(Box::new(move || -> BoxFuture<'static, Result<(), BoxError>> {
            Box::pin(hook())
        }));
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Upper bound for each shutdown phase.
    pub fn phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Export Prometheus metrics on `addr`.
    pub fn metrics_address(mut self, addr: SocketAddr) -> Self {
        self.metrics_address = Some(addr);
        self
    }

    /// Report SIGINT/SIGTERM on the error channel. On by default.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Check the setup and build the servers. Nothing binds yet.
    pub fn build(self) -> Result<Runtime, StartupError> {
        let auth = match (self.auth, self.auth_builder) {
            (Some(runtime), _) => Some(runtime),
            (None, Some(builder)) => Some(Arc::new(builder.build()?) as Arc<dyn AuthRuntime>),
            (None, None) => None,
        };

        let rpc = if self.rpc_enabled {
            if self.apis.is_empty() {
                return Err(StartupError::NoRpcApis);
            }
            let mut rpc = RpcServer::builder()
                .max_message_size(self.max_message_size)
                .keep_alive(self.keep_alive);
            for api in &self.apis {
                for service in api.services() {
                    rpc = rpc.service(service);
                }
            }
            if let Some(runtime) = &auth {
                rpc = rpc.auth(runtime.clone());
            }
            for interceptor in self.unary_interceptors {
                rpc = rpc.unary_interceptor(interceptor);
            }
            for interceptor in self.stream_interceptors {
                rpc = rpc.stream_interceptor(interceptor);
            }
            Some(Arc::new(rpc.build()?))
        } else {
            None
        };

        let gateway = if self.gateway_enabled {
            let routes: Vec<Router> = self
                .apis
                .iter()
                .filter_map(|api| api.gateway_routes())
                .chain(self.gateway_routes)
                .collect();
            if routes.is_empty() {
                return Err(StartupError::NoGatewayRoutes);
            }
            let router = routes.into_iter().fold(Router::new(), Router::merge);
            Some(Arc::new(HttpServer::new("gateway", router, self.request_timeout)))
        } else {
            None
        };

        let (http_api, http_address) = match self.http_address {
            Some(addr) => {
                let router = self.http_handler.ok_or(StartupError::MissingHttpHandler)?;
                let server = HttpServer::new("http", router, self.request_timeout);
                (Some(Arc::new(server)), addr)
            }
            None => (None, String::new()),
        };

        let tls = self.tls.as_ref().map(ServerTls::acceptor).transpose()?;
        if let Some(server_tls) = &self.tls {
            tracing::info!(mutual = server_tls.is_mutual(), "TLS enabled");
        }

        Ok(Runtime {
            name: self.name,
            settings: RuntimeSettings {
                listen_address: self.bind_address,
                max_connections: self.max_connections,
                tls,
                mux: self.mux,
                http_address,
                health_address: self.health_address,
                debug_address: self.debug_address,
                tags: self.tags,
                request_timeout: self.request_timeout,
                phase_timeout: self.phase_timeout,
                metrics_address: self.metrics_address,
                handle_signals: self.handle_signals,
            },
            rpc,
            gateway,
            http_api,
            health: HealthService::new(self.probes, self.health_settings),
            apis: self.apis,
            daemon: self.daemon,
            hook: self.shutdown_hook,
            running: None,
        })
    }
}
