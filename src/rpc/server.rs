//! RPC server over HTTP/2.
//!
//! # Responsibilities
//! - Accept classified connections from a virtual listener
//! - Serve HTTP/2 with hyper, one task per connection
//! - Decode request messages, run the interceptor chain, encode replies
//! - Drain in-flight calls on shutdown
//!
//! # Design Decisions
//! - Errors always travel in trailers, the HTTP status is 200 for any call
//!   that reached a method
//! - Each call gets its own cancellation token, cancelled when the call ends
//!   or the client goes away
//! - Streaming handlers run in their own task so the response can start
//!   before the handler finishes

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::Status;

use super::auth::AuthInterceptor;
use super::codec::{self, FrameDecoder, GRPC_CONTENT_TYPE};
use super::interceptor::{
    chain_stream, chain_unary, RpcRequest, StreamHandler, StreamInterceptor, StreamNext,
    UnaryHandler, UnaryInterceptor, UnaryNext,
};
use super::logging::CallLogger;
use super::registry::{Handler, MethodInfo, MethodRegistry, RegistryError, RpcService};
use super::stream::ChannelStream;
use crate::auth::{AuthRuntime, RequestState};
use crate::mux::{MuxConn, VirtualListener};
use crate::net::ConnectionTracker;

/// Response body type for every RPC response.
pub type RpcBody = BoxBody<Bytes, Infallible>;

/// Messages buffered per direction of a streaming call.
const STREAM_BUFFER: usize = 16;

/// Errors that stop the RPC server.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("listener {0} closed before shutdown")]
    ListenerClosed(String),
}

/// HTTP/2 keepalive for RPC connections.
///
/// The server pings a connection after `interval` without traffic and
/// closes it if the ack does not arrive within `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// `None` disables pings.
    pub interval: Option<Duration>,
    pub timeout: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(60)),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Builder for [`RpcServer`].
pub struct RpcServerBuilder {
    services: Vec<RpcService>,
    unary: Vec<Arc<dyn UnaryInterceptor>>,
    stream: Vec<Arc<dyn StreamInterceptor>>,
    auth: Option<Arc<dyn AuthRuntime>>,
    max_message_size: usize,
    keep_alive: KeepAlive,
}

impl Default for RpcServerBuilder {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            unary: Vec::new(),
            stream: Vec::new(),
            auth: None,
            max_message_size: codec::DEFAULT_MAX_MESSAGE_SIZE,
            keep_alive: KeepAlive::default(),
        }
    }
}

impl RpcServerBuilder {
    pub fn service(mut self, service: RpcService) -> Self {
        self.services.push(service);
        self
    }

    /// Add a unary interceptor after the built-in ones.
    pub fn unary_interceptor(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Self {
        self.unary.push(interceptor);
        self
    }

    /// Add a streaming interceptor after the built-in ones.
    pub fn stream_interceptor(mut self, interceptor: Arc<dyn StreamInterceptor>) -> Self {
        self.stream.push(interceptor);
        self
    }

    /// Authenticate and authorize every call with `runtime`.
    pub fn auth(mut self, runtime: Arc<dyn AuthRuntime>) -> Self {
        self.auth = Some(runtime);
        self
    }

    /// Limit for decoded requests and encoded replies.
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn build(self) -> Result<RpcServer, RegistryError> {
        let registry = MethodRegistry::new(self.services)?;

        let mut unary: Vec<Arc<dyn UnaryInterceptor>> = vec![Arc::new(CallLogger)];
        let mut stream: Vec<Arc<dyn StreamInterceptor>> = vec![Arc::new(CallLogger)];
        if let Some(runtime) = self.auth {
            let auth = AuthInterceptor::new(runtime);
            unary.push(Arc::new(auth.clone()));
            stream.push(Arc::new(auth));
        }
        unary.extend(self.unary);
        stream.extend(self.stream);

        Ok(RpcServer {
            inner: Arc::new(Inner {
                registry,
                unary: chain_unary(unary),
                stream: chain_stream(stream),
                max_message_size: self.max_message_size,
                keep_alive: self.keep_alive,
            }),
            tracker: ConnectionTracker::new("rpc"),
        })
    }
}

struct Inner {
    registry: MethodRegistry,
    unary: Arc<dyn UnaryInterceptor>,
    stream: Arc<dyn StreamInterceptor>,
    max_message_size: usize,
    keep_alive: KeepAlive,
}

/// gRPC-compatible server for registered services.
pub struct RpcServer {
    inner: Arc<Inner>,
    tracker: ConnectionTracker,
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::default()
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.inner.registry
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Serve connections from `listener` until `shutdown` fires.
    ///
    /// Returns an error if the listener closes first. Connections accepted
    /// before shutdown are asked to finish gracefully; see [`drain`].
    ///
    /// [`drain`]: RpcServer::drain
    pub async fn serve(
        &self,
        mut listener: VirtualListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServeError> {
        tracing::info!(
            listener = %listener.name(),
            address = %listener.local_addr(),
            methods = self.inner.registry.len(),
            "RPC server starting"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(_) if shutdown.is_cancelled() => break,
                Err(_) => {
                    tracing::error!(listener = %listener.name(), "RPC listener closed unexpectedly");
                    return Err(ServeError::ListenerClosed(listener.name().to_string()));
                }
            };

            let guard = self.tracker.track(conn.info().id);
            let inner = self.inner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                serve_connection(inner, conn, shutdown).await;
                drop(guard);
            });
        }

        tracing::info!(listener = %listener.name(), "RPC server stopped accepting");
        Ok(())
    }

    /// Wait up to `limit` for open connections to finish. Returns `false`
    /// if some were still open.
    pub async fn drain(&self, limit: Duration) -> bool {
        let drained = self.tracker.wait_idle_for(limit).await;
        if !drained {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "RPC connections still open after drain timeout"
            );
        }
        drained
    }

    /// Handle a single request outside a connection. Used by tests and
    /// embedders that bring their own HTTP/2 transport.
    pub async fn handle<B>(&self, request: Request<B>, peer: Option<SocketAddr>, secure: bool) -> Response<RpcBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        self.inner.clone().handle(request, peer, secure).await
    }
}

async fn serve_connection(inner: Arc<Inner>, conn: MuxConn, shutdown: CancellationToken) {
    let info = conn.info().clone();
    let peer = info.peer_addr;
    let secure = info.is_secure();
    tracing::debug!(connection_id = %info.id, peer_addr = %peer, branch = %info.branch, "RPC connection opened");

    let keep_alive = inner.keep_alive;
    let service = service_fn(move |request: Request<Incoming>| {
        let inner = inner.clone();
        async move { Ok::<_, Infallible>(inner.handle(request, Some(peer), secure).await) }
    });

    let connection = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
        .timer(TokioTimer::new())
        .keep_alive_interval(keep_alive.interval)
        .keep_alive_timeout(keep_alive.timeout)
        .serve_connection(TokioIo::new(conn), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(connection_id = %info.id, error = %e, "RPC connection closed with error");
    }
}

impl Inner {
    async fn handle<B>(
        self: Arc<Self>,
        request: Request<B>,
        peer: Option<SocketAddr>,
        secure: bool,
    ) -> Response<RpcBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        if request.method() != Method::POST {
            return http_status(StatusCode::METHOD_NOT_ALLOWED);
        }
        if !codec::is_grpc_content_type(request.headers().get(CONTENT_TYPE)) {
            return http_status(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        }

        let path = request.uri().path().to_string();
        let Some(method) = self.registry.get(&path).cloned() else {
            return status_response(&Status::unimplemented(format!("unknown method {path}")));
        };

        let (parts, body) = request.into_parts();
        let cancel = CancellationToken::new();
        let mut state = RequestState::new(MetadataMap::from_headers(parts.headers))
            .with_secure(secure)
            .with_cancellation(cancel.clone());
        if let Some(peer) = peer {
            state = state.with_peer(peer);
        }

        match method.handler {
            Handler::Unary(handler) => self.unary(method.info, handler, state, body, cancel).await,
            Handler::Streaming(handler) => self.streaming(method.info, handler, state, body, cancel),
        }
    }

    async fn unary<B>(
        &self,
        info: Arc<MethodInfo>,
        handler: Arc<dyn UnaryHandler>,
        state: RequestState,
        mut body: B,
        cancel: CancellationToken,
    ) -> Response<RpcBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        // Dropped when the call completes or hyper abandons it.
        let _cancel_on_exit = cancel.drop_guard();

        let message = match read_single_message(&mut body, self.max_message_size).await {
            Ok(message) => message,
            Err(status) => return status_response(&status),
        };

        let result = self
            .unary
            .intercept(
                RpcRequest { state, message },
                &info,
                UnaryNext::handler(&info, handler.as_ref()),
            )
            .await;

        match result.and_then(|reply| codec::encode(&reply, self.max_message_size)) {
            Ok(framed) => frames_response(vec![
                Frame::data(framed),
                Frame::trailers(codec::trailers(&Status::ok(""))),
            ]),
            Err(status) => status_response(&status),
        }
    }

    fn streaming<B>(
        &self,
        info: Arc<MethodInfo>,
        handler: Arc<dyn StreamHandler>,
        state: RequestState,
        body: B,
        cancel: CancellationToken,
    ) -> Response<RpcBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let (in_tx, in_rx) = mpsc::channel(STREAM_BUFFER);
        let (out_tx, out_rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pump_requests(body, in_tx, self.max_message_size, cancel.clone()));

        let chain = self.stream.clone();
        let trailer_tx = out_tx.clone();
        let stream = ChannelStream::new(state, in_rx, out_tx, self.max_message_size);
        tokio::spawn(async move {
            let call = chain.intercept(
                Box::new(stream),
                &info,
                StreamNext::handler(&info, handler.as_ref()),
            );
            let status = tokio::select! {
                result = call => result.err().unwrap_or_else(|| Status::ok("")),
                _ = trailer_tx.closed() => {
                    tracing::debug!(method = %info.full_method, "Client abandoned stream");
                    cancel.cancel();
                    return;
                }
            };
            cancel.cancel();
            let _ = trailer_tx.send(Frame::trailers(codec::trailers(&status))).await;
        });

        let body = StreamBody::new(ReceiverStream::new(out_rx).map(Ok::<_, Infallible>));
        grpc_response(BodyExt::boxed(body))
    }
}

/// Read a unary request body, which must carry exactly one message.
async fn read_single_message<B>(body: &mut B, max_message_size: usize) -> Result<Bytes, Status>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut decoder = FrameDecoder::new(max_message_size);
    let mut message = None;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| Status::cancelled(format!("request body failed: {e}")))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        decoder.push(&data);
        while let Some(decoded) = decoder.decode()? {
            if message.replace(decoded).is_some() {
                return Err(Status::unimplemented(
                    "unary call carried more than one request message",
                ));
            }
        }
    }

    if decoder.has_remaining() {
        return Err(Status::internal("truncated request message"));
    }
    message.ok_or_else(|| Status::internal("missing request message"))
}

/// Feed decoded request messages of a streaming call into `tx`.
async fn pump_requests<B>(
    mut body: B,
    tx: mpsc::Sender<Result<Bytes, Status>>,
    max_message_size: usize,
    cancel: CancellationToken,
) where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut decoder = FrameDecoder::new(max_message_size);
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => return,
            frame = body.frame() => frame,
        };
        let data = match frame {
            None => {
                if decoder.has_remaining() {
                    let _ = tx.send(Err(Status::internal("truncated request message"))).await;
                }
                return;
            }
            Some(Err(e)) => {
                cancel.cancel();
                let _ = tx
                    .send(Err(Status::cancelled(format!("request body failed: {e}"))))
                    .await;
                return;
            }
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => data,
                Err(_) => continue,
            },
        };

        decoder.push(&data);
        loop {
            match decoder.decode() {
                Ok(Some(message)) => {
                    if tx.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    let _ = tx.send(Err(status)).await;
                    return;
                }
            }
        }
    }
}

fn grpc_response(body: RpcBody) -> Response<RpcBody> {
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    response
}

fn frames_response(frames: Vec<Frame<Bytes>>) -> Response<RpcBody> {
    let stream = futures_util::stream::iter(frames.into_iter().map(Ok::<_, Infallible>));
    grpc_response(BodyExt::boxed(StreamBody::new(stream)))
}

fn status_response(status: &Status) -> Response<RpcBody> {
    frames_response(vec![Frame::trailers(codec::trailers(status))])
}

fn http_status(code: StatusCode) -> Response<RpcBody> {
    let mut response = Response::new(Empty::new().boxed());
    *response.status_mut() = code;
    response
}
