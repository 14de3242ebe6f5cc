//! svcmuxd: runs the service runtime with a built-in echo API.
//!
//! ```text
//! svcmuxd --config svcmux.toml
//! ```
//!
//! The echo API registers `svcmux.echo.v1.Echo/Echo` (unary) and
//! `svcmux.echo.v1.Echo/Chat` (bidirectional streaming), plus `POST /v1/echo`
//! on the gateway and HTTP API servers.

use async_trait::async_trait;
use axum::{body::Bytes, routing::post, Router};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tonic::Status;

use svcmux::config::{load_config, RuntimeConfig};
use svcmux::lifecycle::{RpcApi, RuntimeBuilder};
use svcmux::observability::init_logging;
use svcmux::rpc::{BoxStream, RpcRequest, RpcService};

#[derive(Parser)]
#[command(name = "svcmuxd")]
#[command(about = "RPC and HTTP gateway on one listener", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

struct EchoApi;

async fn echo_http(body: Bytes) -> Bytes {
    body
}

async fn echo(request: RpcRequest) -> Result<Bytes, Status> {
    Ok(request.message)
}

async fn chat(mut stream: BoxStream) -> Result<(), Status> {
    while let Some(message) = stream.recv().await? {
        stream.send(message).await?;
    }
    Ok(())
}

#[async_trait]
impl RpcApi for EchoApi {
    fn services(&self) -> Vec<RpcService> {
        vec![RpcService::new("svcmux.echo.v1.Echo")
            .unary("Echo", echo)
            .streaming("Chat", chat)]
    }

    fn gateway_routes(&self) -> Option<Router> {
        Some(Router::new().route("/v1/echo", post(echo_http)))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("svcmuxd: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => RuntimeConfig::default(),
    };

    if let Err(e) = init_logging(&config.observability) {
        eprintln!("svcmuxd: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        tls = config.listener.tls.is_some(),
        "svcmuxd starting"
    );

    let mut builder = match RuntimeBuilder::from_config(&config) {
        Ok(builder) => builder.api(Arc::new(EchoApi)),
        Err(e) => {
            tracing::error!(error = %e, "Invalid runtime setup");
            return ExitCode::FAILURE;
        }
    };
    if config.http.enabled {
        builder = builder.http_handler(Router::new().route("/v1/echo", post(echo_http)));
    }

    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Invalid runtime setup");
            return ExitCode::FAILURE;
        }
    };

    match runtime.run().await {
        Ok(report) if report.is_clean() => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(report) => {
            tracing::error!(failed = ?report.failed, "Shutdown incomplete");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}
