//! Server orchestrator.
//!
//! # Responsibilities
//! - Bind every configured listener, then spawn one task per server
//! - Report each task's terminal condition on a shared error channel
//! - Stop everything in a fixed order, each phase bounded in time
//!
//! # Shutdown Phases
//! ```text
//! 1 api handlers   close RpcApi resources
//! 2 rpc server     stop mux accept loops, drain in-flight calls
//! 3 gateway, http  graceful HTTP shutdown
//! 4 health         endpoints and poller
//! 5 debug
//! 6 daemon
//! 7 shutdown hook
//! 8 telemetry      metrics exporter
//! ```
//! A failing or slow phase is recorded in the [`ShutdownReport`] and the
//! next phase still runs.

use async_trait::async_trait;
use axum::Router;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::shutdown::Shutdown;
use super::signals::wait_for_signal;
use super::startup::StartupError;
use crate::auth::BoxError;
use crate::health::HealthService;
use crate::http::{debug_router, HttpServer, ServerInfo};
use crate::mux::{Any, Http1Fast, ListenerTree, MuxConfig, TlsHandshake, VirtualListener};
use crate::net::Listener;
use crate::observability::{start_exporter, MetricsError, MetricsExporter};
use crate::rpc::{RpcServer, RpcService};

/// Events buffered on the error channel before reports are dropped.
pub const ERROR_CHANNEL_DEPTH: usize = 16;

/// Runs once during shutdown, after the daemon has stopped.
pub type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// An application API served by the runtime.
#[async_trait]
pub trait RpcApi: Send + Sync {
    /// RPC services to register.
    fn services(&self) -> Vec<RpcService>;

    /// Routes served on the HTTP/1.1 branch of the shared listener.
    fn gateway_routes(&self) -> Option<Router> {
        None
    }

    /// Release resources. Called first during shutdown.
    async fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Background work without a network interface.
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Run until stopped.
    async fn serve(&self) -> Result<(), BoxError>;

    /// Ask [`serve`](Daemon::serve) to return.
    async fn stop(&self) -> Result<(), BoxError>;
}

/// Why a runtime task ended.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("received {0}")]
    Signal(&'static str),

    #[error("{0} stopped")]
    Stopped(&'static str),

    #[error("{task} returned an error: {source}")]
    Failed {
        task: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Outcome of [`Runtime::stop`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Addresses the runtime actually bound.
#[derive(Debug, Clone)]
pub struct BoundAddrs {
    pub listener: Option<SocketAddr>,
    pub http: Option<SocketAddr>,
    pub health: SocketAddr,
    pub debug: Option<SocketAddr>,
}

/// Fixed settings produced by [`RuntimeBuilder`](super::RuntimeBuilder).
pub(crate) struct RuntimeSettings {
    pub listen_address: String,
    pub max_connections: usize,
    pub tls: Option<TlsAcceptor>,
    pub mux: MuxConfig,
    pub http_address: String,
    pub health_address: String,
    pub debug_address: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub request_timeout: Duration,
    pub phase_timeout: Duration,
    pub metrics_address: Option<SocketAddr>,
    pub handle_signals: bool,
}

/// Serves the configured RPC, gateway, HTTP, health and debug endpoints.
pub struct Runtime {
    pub(crate) name: String,
    pub(crate) settings: RuntimeSettings,
    pub(crate) rpc: Option<Arc<RpcServer>>,
    pub(crate) gateway: Option<Arc<HttpServer>>,
    pub(crate) http_api: Option<Arc<HttpServer>>,
    pub(crate) health: HealthService,
    pub(crate) apis: Vec<Arc<dyn RpcApi>>,
    pub(crate) daemon: Option<Arc<dyn Daemon>>,
    pub(crate) hook: Option<ShutdownHook>,
    pub(crate) running: Option<Running>,
}

pub(crate) struct Running {
    addrs: BoundAddrs,
    shutdown: Shutdown,
    tokens: PhaseTokens,
    mux: Vec<JoinHandle<()>>,
    rpc: Option<JoinHandle<()>>,
    gateway: Option<JoinHandle<()>>,
    http: Vec<JoinHandle<()>>,
    health: Vec<JoinHandle<()>>,
    debug: Option<JoinHandle<()>>,
    daemon: Option<JoinHandle<()>>,
    signal: Option<JoinHandle<()>>,
    exporter: Option<MetricsExporter>,
}

struct PhaseTokens {
    mux: CancellationToken,
    rpc: CancellationToken,
    gateway: CancellationToken,
    http: CancellationToken,
    health: CancellationToken,
    debug: CancellationToken,
}

impl PhaseTokens {
    fn new(shutdown: &Shutdown) -> Self {
        Self {
            mux: shutdown.subscribe(),
            rpc: shutdown.subscribe(),
            gateway: shutdown.subscribe(),
            http: shutdown.subscribe(),
            health: shutdown.subscribe(),
            debug: shutdown.subscribe(),
        }
    }
}

fn report(errc: &mpsc::Sender<RuntimeError>, event: RuntimeError) {
    match errc.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            tracing::warn!(event = %event, "Runtime error channel full, dropping event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Spawn `work` and report how it ended.
fn spawn_reported<F, E>(errc: &mpsc::Sender<RuntimeError>, task: &'static str, work: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    let errc = errc.clone();
    tokio::spawn(async move {
        let event = match work.await {
            Ok(()) => RuntimeError::Stopped(task),
            Err(e) => RuntimeError::Failed {
                task,
                source: e.into(),
            },
        };
        match &event {
            RuntimeError::Failed { .. } => tracing::error!(task, error = %event, "Runtime task failed"),
            _ => tracing::info!(task, "Runtime task stopped"),
        }
        report(&errc, event);
    })
}

async fn bind_tcp(what: &'static str, addr: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind {
            what,
            addr: addr.to_string(),
            source,
        })
}

/// Route every connection on `listener` through a TLS node to one virtual
/// listener.
fn tls_only(
    listener: TcpListener,
    max_connections: usize,
    mux: MuxConfig,
    acceptor: TlsAcceptor,
) -> Result<(ListenerTree, VirtualListener), StartupError> {
    let mut tree = ListenerTree::new(Listener::from_tcp(listener, max_connections), mux)?;
    let upstream = tree.route(tree.root(), TlsHandshake)?;
    let node = tree.terminate_tls(upstream, acceptor);
    let inner = tree.route(node, Any)?;
    Ok((tree, inner))
}

async fn join_all(tasks: Vec<JoinHandle<()>>) -> Result<(), BoxError> {
    for task in tasks {
        task.await?;
    }
    Ok(())
}

async fn run_phase<F>(report: &mut ShutdownReport, phase: &'static str, limit: Duration, work: F)
where
    F: Future<Output = Result<(), BoxError>>,
{
    tracing::info!(phase, "Shutdown phase starting");
    match time::timeout(limit, work).await {
        Ok(Ok(())) => report.completed.push(phase),
        Ok(Err(e)) => {
            tracing::error!(phase, error = %e, "Shutdown phase failed");
            report.failed.push((phase, e.to_string()));
        }
        Err(_) => {
            tracing::error!(phase, timeout_ms = limit.as_millis() as u64, "Shutdown phase timed out");
            report.failed.push((phase, format!("timed out after {limit:?}")));
        }
    }
}

/// What is left of a phase's `limit` for draining connections, keeping a
/// tenth in reserve so the drain verdict lands before the phase times out.
fn drain_budget(limit: Duration, phase_started: Instant) -> Duration {
    (limit - limit / 10).saturating_sub(phase_started.elapsed())
}

impl Runtime {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound addresses, once started.
    pub fn addresses(&self) -> Option<&BoundAddrs> {
        self.running.as_ref().map(|r| &r.addrs)
    }

    pub fn rpc(&self) -> Option<&Arc<RpcServer>> {
        self.rpc.as_ref()
    }

    pub fn health(&self) -> &HealthService {
        &self.health
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind all listeners and spawn every server.
    ///
    /// Bind failures are returned directly and leave nothing running. After
    /// that, every task reports how it ended on the returned channel,
    /// including clean stops and SIGINT/SIGTERM.
    pub async fn start(&mut self) -> Result<mpsc::Receiver<RuntimeError>, StartupError> {
        if self.running.is_some() {
            return Err(StartupError::AlreadyStarted);
        }
        let settings = &self.settings;

        let tree = if self.rpc.is_some() || self.gateway.is_some() {
            Some(
                ListenerTree::bind(&settings.listen_address, settings.max_connections, settings.mux.clone())
                    .await?,
            )
        } else {
            None
        };
        let http_listener = match &self.http_api {
            Some(_) => Some(bind_tcp("http", &settings.http_address).await?),
            None => None,
        };
        let health_listener = bind_tcp("health", &settings.health_address).await?;
        let debug_listener = match &settings.debug_address {
            Some(addr) => Some(bind_tcp("debug", addr).await?),
            None => None,
        };

        let exporter = match settings.metrics_address {
            Some(addr) => match start_exporter(addr) {
                Ok(exporter) => Some(exporter),
                Err(MetricsError::AlreadyInstalled) => {
                    tracing::warn!("Metrics recorder already installed, exporter not started");
                    None
                }
                Err(e) => return Err(StartupError::Telemetry(e)),
            },
            None => None,
        };

        let (errc, errors) = mpsc::channel(ERROR_CHANNEL_DEPTH);
        let shutdown = Shutdown::new();
        let tokens = PhaseTokens::new(&shutdown);

        let signal = settings.handle_signals.then(|| {
            let errc = errc.clone();
            tokio::spawn(async move {
                match wait_for_signal().await {
                    Ok(name) => report(&errc, RuntimeError::Signal(name)),
                    Err(e) => report(
                        &errc,
                        RuntimeError::Failed {
                            task: "signal handler",
                            source: e.into(),
                        },
                    ),
                }
            })
        });

        let mut addrs = BoundAddrs {
            listener: None,
            http: None,
            health: health_listener.local_addr().map_err(|source| StartupError::Bind {
                what: "health",
                addr: settings.health_address.clone(),
                source,
            })?,
            debug: None,
        };

        let debug = match debug_listener {
            Some(listener) => {
                addrs.debug = listener.local_addr().ok();
                tracing::info!(address = ?addrs.debug, "Starting debug server");
                let server = HttpServer::new(
                    "debug",
                    debug_router(ServerInfo::new(settings.tags.clone())),
                    settings.request_timeout,
                );
                let token = tokens.debug.clone();
                Some(spawn_reported(&errc, "debug server", async move {
                    server.serve_tcp(listener, token).await
                }))
            }
            None => None,
        };

        let mut mux = Vec::new();
        let mut rpc = None;
        let mut gateway = None;
        if let Some(mut tree) = tree {
            addrs.listener = Some(tree.local_addr());
            let node = match &settings.tls {
                Some(acceptor) => {
                    let upstream = tree.route(tree.root(), TlsHandshake)?;
                    tree.terminate_tls(upstream, acceptor.clone())
                }
                None => {
                    tracing::warn!("No TLS key specified, serving plaintext");
                    tree.root()
                }
            };

            if let Some(server) = &self.gateway {
                let listener = tree.route(node, Http1Fast::with_extra_methods(["PATCH"]))?;
                let server = server.clone();
                let token = tokens.gateway.clone();
                tracing::info!(address = ?addrs.listener, "Starting gateway server");
                gateway = Some(spawn_reported(&errc, "gateway server", async move {
                    server.serve_mux(listener, token).await
                }));
            }
            if let Some(server) = &self.rpc {
                let listener = tree.route(node, Any)?;
                let server = server.clone();
                let token = tokens.rpc.clone();
                tracing::info!(address = ?addrs.listener, "Starting RPC server");
                rpc = Some(spawn_reported(&errc, "rpc server", async move {
                    server.serve(listener, token).await
                }));
            }

            let token = tokens.mux.clone();
            mux.push(spawn_reported(&errc, "mux", async move { tree.serve(token).await }));
        }

        let mut http = Vec::new();
        if let (Some(server), Some(listener)) = (&self.http_api, http_listener) {
            addrs.http = listener.local_addr().ok();
            tracing::info!(address = ?addrs.http, tls = settings.tls.is_some(), "Starting HTTP server");
            let server = server.clone();
            let token = tokens.http.clone();
            match &settings.tls {
                Some(acceptor) => {
                    let (tree, inner) =
                        tls_only(listener, settings.max_connections, settings.mux.clone(), acceptor.clone())?;
                    let tree_token = token.clone();
                    http.push(spawn_reported(&errc, "http mux", async move {
                        tree.serve(tree_token).await
                    }));
                    http.push(spawn_reported(&errc, "http server", async move {
                        server.serve_mux(inner, token).await
                    }));
                }
                None => {
                    http.push(spawn_reported(&errc, "http server", async move {
                        server.serve_tcp(listener, token).await
                    }));
                }
            }
        }

        tracing::info!(address = %addrs.health, "Starting health service");
        let health_server = HttpServer::new("health", self.health.router(), settings.request_timeout);
        let token = tokens.health.clone();
        let mut health = vec![spawn_reported(&errc, "health server", async move {
            health_server.serve_tcp(health_listener, token).await
        })];
        let poller = self.health.clone();
        let token = tokens.health.clone();
        health.push(tokio::spawn(async move { poller.run(token).await }));

        let daemon = self.daemon.clone().map(|daemon| {
            tracing::info!("Starting daemon");
            spawn_reported(&errc, "daemon", async move { daemon.serve().await })
        });

        tracing::info!(name = %self.name, "Runtime started");
        self.running = Some(Running {
            addrs,
            shutdown,
            tokens,
            mux,
            rpc,
            gateway,
            http,
            health,
            debug,
            daemon,
            signal,
            exporter,
        });
        Ok(errors)
    }

    /// Stop everything, phase by phase. A no-op if not started.
    pub async fn stop(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let Some(mut running) = self.running.take() else {
            return report;
        };
        let limit = self.settings.phase_timeout;
        tracing::info!(name = %self.name, "Shutting down");

        let apis = self.apis.clone();
        run_phase(&mut report, "api handlers", limit, async move {
            let mut first_error = None;
            for api in &apis {
                if let Err(e) = api.close().await {
                    tracing::error!(error = %e, "Error closing API handler");
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
        .await;

        if let Some(server) = self.rpc.clone() {
            running.tokens.rpc.cancel();
            let mut tasks: Vec<JoinHandle<()>> = running.rpc.take().into_iter().collect();
            if self.gateway.is_none() {
                running.tokens.mux.cancel();
                tasks.append(&mut running.mux);
            }
            run_phase(&mut report, "rpc server", limit, async move {
                let started = Instant::now();
                join_all(tasks).await?;
                if server.drain(drain_budget(limit, started)).await {
                    Ok(())
                } else {
                    Err("RPC connections still open".into())
                }
            })
            .await;
        }

        if let Some(server) = self.gateway.clone() {
            running.tokens.gateway.cancel();
            running.tokens.mux.cancel();
            let mut tasks: Vec<JoinHandle<()>> = running.gateway.take().into_iter().collect();
            tasks.append(&mut running.mux);
            run_phase(&mut report, "gateway server", limit, async move {
                let started = Instant::now();
                join_all(tasks).await?;
                if server.drain(drain_budget(limit, started)).await {
                    Ok(())
                } else {
                    Err("gateway connections still open".into())
                }
            })
            .await;
        }

        if self.http_api.is_some() {
            running.tokens.http.cancel();
            let tasks = std::mem::take(&mut running.http);
            run_phase(&mut report, "http server", limit, join_all(tasks)).await;
        }

        running.tokens.health.cancel();
        let tasks = std::mem::take(&mut running.health);
        run_phase(&mut report, "health server", limit, join_all(tasks)).await;

        if let Some(task) = running.debug.take() {
            running.tokens.debug.cancel();
            run_phase(&mut report, "debug server", limit, join_all(vec![task])).await;
        }

        if let Some(daemon) = self.daemon.clone() {
            let task = running.daemon.take();
            run_phase(&mut report, "daemon", limit, async move {
                daemon.stop().await?;
                join_all(task.into_iter().collect()).await
            })
            .await;
        }

        if let Some(hook) = self.hook.take() {
            run_phase(&mut report, "shutdown hook", limit, hook()).await;
        }

        if let Some(exporter) = running.exporter.take() {
            run_phase(&mut report, "telemetry", limit, async move {
                exporter.stop();
                Ok(())
            })
            .await;
        }

        if let Some(signal) = running.signal.take() {
            signal.abort();
        }
        running.shutdown.trigger();

        if report.is_clean() {
            tracing::info!(phases = report.completed.len(), "Shutdown complete");
        } else {
            tracing::warn!(failed = ?report.failed, "Shutdown finished with errors");
        }
        report
    }

    /// Start, wait for the first terminal event, then stop.
    pub async fn run(mut self) -> Result<ShutdownReport, StartupError> {
        let mut errors = self.start().await?;
        match errors.recv().await {
            Some(RuntimeError::Signal(signal)) => tracing::info!(signal, "Stopping on signal"),
            Some(event) => tracing::error!(event = %event, "Stopping after task ended"),
            None => {}
        }
        Ok(self.stop().await)
    }
}
