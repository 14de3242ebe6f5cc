//! HTTP server setup.
//!
//! # Responsibilities
//! - Wrap an axum Router with the standard middleware stack
//! - Serve it on a mux virtual listener (gateway) or a plain TCP listener (API)
//! - Stop accepting on shutdown and let in-flight requests finish

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::mux::{ConnInfo, MuxConn, VirtualListener};
use crate::net::ConnectionTracker;
use crate::rpc::ServeError;

/// Header carrying the per-request correlation id.
pub const X_REQUEST_ID: &str = "x-request-id";

/// An axum application served over HTTP/1.1 and HTTP/2.
pub struct HttpServer {
    name: String,
    router: Router,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Layer `router` with tracing, request ids and a request timeout.
    #[allow(deprecated)]
    pub fn new(name: impl Into<String>, router: Router, request_timeout: Duration) -> Self {
        let name = name.into();
        let header = http::HeaderName::from_static(X_REQUEST_ID);
        let router = router
            .layer(TimeoutLayer::new(request_timeout))
            .layer(PropagateRequestIdLayer::new(header.clone()))
            .layer(SetRequestIdLayer::new(header, MakeRequestUuid))
            .layer(TraceLayer::new_for_http());

        Self {
            tracker: ConnectionTracker::new(name.as_str()),
            name,
            router,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Serve connections handed over by the multiplexer.
    ///
    /// Handlers can extract `ConnectInfo<SocketAddr>` and [`ConnInfo`].
    pub async fn serve_mux(
        &self,
        mut listener: VirtualListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServeError> {
        tracing::info!(server = %self.name, listener = %listener.name(), "HTTP server starting");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(_) if shutdown.is_cancelled() => break,
                Err(_) => {
                    tracing::error!(server = %self.name, "HTTP listener closed unexpectedly");
                    return Err(ServeError::ListenerClosed(listener.name().to_string()));
                }
            };

            let guard = self.tracker.track(conn.info().id);
            let router = self.router.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                serve_connection(router, conn, shutdown).await;
                drop(guard);
            });
        }

        tracing::info!(server = %self.name, "HTTP server stopped accepting");
        Ok(())
    }

    /// Serve on a dedicated TCP listener until `shutdown` fires.
    pub async fn serve_tcp(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(server = %self.name, address = %addr, "HTTP server starting");

        let app = self
            .router
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        tracing::info!(server = %self.name, "HTTP server stopped");
        Ok(())
    }

    /// Wait up to `limit` for mux connections to close.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.tracker.wait_idle_for(limit).await
    }
}

async fn serve_connection(router: Router, conn: MuxConn, shutdown: CancellationToken) {
    let info: ConnInfo = conn.info().clone();
    let id = info.id;
    let service = service_fn(move |mut request: http::Request<Incoming>| {
        request
            .extensions_mut()
            .insert(ConnectInfo(info.peer_addr));
        request.extensions_mut().insert(info.clone());
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.oneshot(request).await.into_ok()) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(conn), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(connection_id = %id, error = %e, "HTTP connection closed with error");
    }
}

/// `Result<T, Infallible>` → `T`.
trait IntoOk<T> {
    fn into_ok(self) -> T;
}

impl<T> IntoOk<T> for Result<T, Infallible> {
    fn into_ok(self) -> T {
        match self {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{ListenerTree, MuxConfig};
    use crate::mux::matcher::Http1Fast;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn serves_router_behind_mux_with_request_id() {
        let mut tree = ListenerTree::bind("127.0.0.1:0", 16, MuxConfig::default())
            .await
            .unwrap();
        let addr = tree.local_addr();
        let listener = tree.route(tree.root(), Http1Fast::new()).unwrap();

        let router = Router::new().route(
            "/whoami",
            get(|ConnectInfo(peer): ConnectInfo<SocketAddr>| async move { peer.ip().to_string() }),
        );
        let server = std::sync::Arc::new(HttpServer::new("gateway", router, Duration::from_secs(5)));

        let shutdown = CancellationToken::new();
        tokio::spawn(tree.serve(shutdown.clone()));
        let serving = {
            let server = server.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve_mux(listener, shutdown).await })
        };

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /whoami HTTP/1.1\r\nhost: test\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.to_ascii_lowercase().contains("x-request-id:"));
        assert!(response.ends_with("127.0.0.1"));

        shutdown.cancel();
        assert!(serving.await.unwrap().is_ok());
    }
}
