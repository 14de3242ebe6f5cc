//! Interceptor chains for unary and streaming calls.
//!
//! # Data Flow
//! ```text
//! chain [A, B, C] + handler H
//!     A.intercept(req, next₁)
//!         → next₁.run → B.intercept(req, next₂)
//!             → next₂.run → C.intercept(req, next₃)
//!                 → next₃.run → H.call(req)
//! ```
//!
//! # Design Decisions
//! - A continuation is a slice of the remaining interceptors plus a tail
//! - Not calling `next.run` short-circuits everything after
//! - Composites nest: a chain used as an interceptor ends in the outer `next`

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tonic::Status;

use super::registry::MethodInfo;
use super::stream::BoxStream;
use crate::auth::RequestState;

/// A unary request as it travels through the chain.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub state: RequestState,
    pub message: Bytes,
}

/// Application handler for unary calls.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, request: RpcRequest) -> Result<Bytes, Status>;
}

/// Application handler for streaming calls.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn call(&self, stream: BoxStream) -> Result<(), Status>;
}

#[async_trait]
impl<F, Fut> UnaryHandler for F
where
    F: Fn(RpcRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes, Status>> + Send,
{
    async fn call(&self, request: RpcRequest) -> Result<Bytes, Status> {
        (self)(request).await
    }
}

#[async_trait]
impl<F, Fut> StreamHandler for F
where
    F: Fn(BoxStream) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Status>> + Send,
{
    async fn call(&self, stream: BoxStream) -> Result<(), Status> {
        (self)(stream).await
    }
}

/// Middleware around unary calls.
#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    async fn intercept(
        &self,
        request: RpcRequest,
        info: &MethodInfo,
        next: UnaryNext<'_>,
    ) -> Result<Bytes, Status>;
}

/// Middleware around streaming calls.
#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    async fn intercept(
        &self,
        stream: BoxStream,
        info: &MethodInfo,
        next: StreamNext<'_>,
    ) -> Result<(), Status>;
}

enum UnaryTail<'a> {
    Handler(&'a dyn UnaryHandler),
    Next(Box<UnaryNext<'a>>),
}

/// The rest of a unary chain.
pub struct UnaryNext<'a> {
    rest: &'a [Arc<dyn UnaryInterceptor>],
    info: &'a MethodInfo,
    tail: UnaryTail<'a>,
}

impl<'a> UnaryNext<'a> {
    /// A continuation that calls `handler` directly.
    pub fn handler(info: &'a MethodInfo, handler: &'a dyn UnaryHandler) -> Self {
        Self {
            rest: &[],
            info,
            tail: UnaryTail::Handler(handler),
        }
    }

    /// Advance the chain.
    pub fn run(self, request: RpcRequest) -> BoxFuture<'a, Result<Bytes, Status>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((first, rest)) => {
                    let next = UnaryNext {
                        rest,
                        info: self.info,
                        tail: self.tail,
                    };
                    first.intercept(request, self.info, next).await
                }
                None => match self.tail {
                    UnaryTail::Handler(handler) => handler.call(request).await,
                    UnaryTail::Next(outer) => outer.run(request).await,
                },
            }
        })
    }
}

enum StreamTail<'a> {
    Handler(&'a dyn StreamHandler),
    Next(Box<StreamNext<'a>>),
}

/// The rest of a streaming chain.
pub struct StreamNext<'a> {
    rest: &'a [Arc<dyn StreamInterceptor>],
    info: &'a MethodInfo,
    tail: StreamTail<'a>,
}

impl<'a> StreamNext<'a> {
    pub fn handler(info: &'a MethodInfo, handler: &'a dyn StreamHandler) -> Self {
        Self {
            rest: &[],
            info,
            tail: StreamTail::Handler(handler),
        }
    }

    pub fn run(self, stream: BoxStream) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((first, rest)) => {
                    let next = StreamNext {
                        rest,
                        info: self.info,
                        tail: self.tail,
                    };
                    first.intercept(stream, self.info, next).await
                }
                None => match self.tail {
                    StreamTail::Handler(handler) => handler.call(stream).await,
                    StreamTail::Next(outer) => outer.run(stream).await,
                },
            }
        })
    }
}

/// Calls straight through. Used when a chain is empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl UnaryInterceptor for Passthrough {
    async fn intercept(
        &self,
        request: RpcRequest,
        _info: &MethodInfo,
        next: UnaryNext<'_>,
    ) -> Result<Bytes, Status> {
        next.run(request).await
    }
}

#[async_trait]
impl StreamInterceptor for Passthrough {
    async fn intercept(
        &self,
        stream: BoxStream,
        _info: &MethodInfo,
        next: StreamNext<'_>,
    ) -> Result<(), Status> {
        next.run(stream).await
    }
}

struct UnaryChain {
    interceptors: Vec<Arc<dyn UnaryInterceptor>>,
}

#[async_trait]
impl UnaryInterceptor for UnaryChain {
    async fn intercept(
        &self,
        request: RpcRequest,
        info: &MethodInfo,
        next: UnaryNext<'_>,
    ) -> Result<Bytes, Status> {
        UnaryNext {
            rest: &self.interceptors,
            info,
            tail: UnaryTail::Next(Box::new(next)),
        }
        .run(request)
        .await
    }
}

struct StreamChain {
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
}

#[async_trait]
impl StreamInterceptor for StreamChain {
    async fn intercept(
        &self,
        stream: BoxStream,
        info: &MethodInfo,
        next: StreamNext<'_>,
    ) -> Result<(), Status> {
        StreamNext {
            rest: &self.interceptors,
            info,
            tail: StreamTail::Next(Box::new(next)),
        }
        .run(stream)
        .await
    }
}

/// Compose unary interceptors. The first one sees the call first.
pub fn chain_unary(mut interceptors: Vec<Arc<dyn UnaryInterceptor>>) -> Arc<dyn UnaryInterceptor> {
    match interceptors.len() {
        0 => Arc::new(Passthrough),
        1 => interceptors.remove(0),
        _ => Arc::new(UnaryChain { interceptors }),
    }
}

/// Compose streaming interceptors. The first one sees the call first.
pub fn chain_stream(
    mut interceptors: Vec<Arc<dyn StreamInterceptor>>,
) -> Arc<dyn StreamInterceptor> {
    match interceptors.len() {
        0 => Arc::new(Passthrough),
        1 => interceptors.remove(0),
        _ => Arc::new(StreamChain { interceptors }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::MethodKind;
    use crate::rpc::stream::{wrap_stream, ServerStream};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records entry and exit and appends its name to the response.
    struct Tag {
        name: &'static str,
        log: Log,
    }

    #[async_trait]
    impl UnaryInterceptor for Tag {
        async fn intercept(
            &self,
            request: RpcRequest,
            _info: &MethodInfo,
            next: UnaryNext<'_>,
        ) -> Result<Bytes, Status> {
            self.log.lock().unwrap().push(format!("{} in", self.name));
            let response = next.run(request).await?;
            self.log.lock().unwrap().push(format!("{} out", self.name));
            let mut out = response.to_vec();
            out.extend_from_slice(self.name.as_bytes());
            Ok(out.into())
        }
    }

    struct Deny;

    #[async_trait]
    impl UnaryInterceptor for Deny {
        async fn intercept(
            &self,
            _request: RpcRequest,
            _info: &MethodInfo,
            _next: UnaryNext<'_>,
        ) -> Result<Bytes, Status> {
            Err(Status::permission_denied("no"))
        }
    }

    fn tag(name: &'static str, log: &Log) -> Arc<dyn UnaryInterceptor> {
        Arc::new(Tag {
            name,
            log: log.clone(),
        })
    }

    fn info() -> MethodInfo {
        MethodInfo::new("/test.Echo/Say", MethodKind::Unary, None)
    }

    fn request() -> RpcRequest {
        RpcRequest {
            state: RequestState::default(),
            message: Bytes::from_static(b"hi:"),
        }
    }

    async fn echo(request: RpcRequest) -> Result<Bytes, Status> {
        Ok(request.message)
    }

    #[tokio::test]
    async fn empty_chain_is_the_handler() {
        let chain = chain_unary(Vec::new());
        let info = info();
        let out = chain
            .intercept(request(), &info, UnaryNext::handler(&info, &echo))
            .await
            .unwrap();
        assert_eq!(out, "hi:");
    }

    #[tokio::test]
    async fn chain_runs_in_onion_order() {
        let log: Log = Arc::default();
        let chain = chain_unary(vec![tag("A", &log), tag("B", &log)]);
        let info = info();
        let out = chain
            .intercept(request(), &info, UnaryNext::handler(&info, &echo))
            .await
            .unwrap();

        // B's effect is visible to A on the way out.
        assert_eq!(out, "hi:BA");
        assert_eq!(*log.lock().unwrap(), ["A in", "B in", "B out", "A out"]);
    }

    #[tokio::test]
    async fn error_short_circuits_rest_of_chain() {
        let log: Log = Arc::default();
        let deny: Arc<dyn UnaryInterceptor> = Arc::new(Deny);
        let chain = chain_unary(vec![tag("A", &log), deny, tag("C", &log)]);
        let info = info();
        let reached = Arc::new(Mutex::new(false));
        let flag = reached.clone();
        let handler = move |_req: RpcRequest| {
            let flag = flag.clone();
            async move {
                *flag.lock().unwrap() = true;
                Ok::<_, Status>(Bytes::new())
            }
        };

        let err = chain
            .intercept(request(), &info, UnaryNext::handler(&info, &handler))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
        assert_eq!(*log.lock().unwrap(), ["A in"]);
        assert!(!*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn nested_chains_end_in_outer_continuation() {
        let log: Log = Arc::default();
        let inner = chain_unary(vec![tag("B", &log), tag("C", &log)]);
        let outer = chain_unary(vec![tag("A", &log), inner]);
        let info = info();
        let out = outer
            .intercept(request(), &info, UnaryNext::handler(&info, &echo))
            .await
            .unwrap();
        assert_eq!(out, "hi:CBA");
    }

    /// Attaches a subject for everything downstream.
    struct Impersonate(&'static str);

    #[async_trait]
    impl StreamInterceptor for Impersonate {
        async fn intercept(
            &self,
            stream: BoxStream,
            _info: &MethodInfo,
            next: StreamNext<'_>,
        ) -> Result<(), Status> {
            let state = stream.state().clone().with_authenticated(crate::auth::Authenticated {
                subject: self.0.to_string(),
                claims: Arc::default(),
            });
            next.run(wrap_stream(stream, state)).await
        }
    }

    struct NullStream(RequestState);

    #[async_trait]
    impl ServerStream for NullStream {
        fn state(&self) -> &RequestState {
            &self.0
        }
        async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
            Ok(None)
        }
        async fn send(&mut self, _message: Bytes) -> Result<(), Status> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stream_interceptors_substitute_state() {
        let first: Arc<dyn StreamInterceptor> = Arc::new(Impersonate("first"));
        let second: Arc<dyn StreamInterceptor> = Arc::new(Impersonate("second"));
        let chain = chain_stream(vec![first, second]);
        let info = MethodInfo::new("/test.Echo/Chat", MethodKind::Streaming, None);
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let handler = move |stream: BoxStream| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = stream.state().current_user().to_string();
                Ok::<(), Status>(())
            }
        };

        chain
            .intercept(
                Box::new(NullStream(RequestState::default())),
                &info,
                StreamNext::handler(&info, &handler),
            )
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), "second");
    }

    #[tokio::test]
    async fn empty_stream_chain_is_the_handler() {
        let chain = chain_stream(Vec::new());
        let info = MethodInfo::new("/test.Echo/Chat", MethodKind::Streaming, None);
        let handler = |_stream: BoxStream| async { Err::<(), _>(Status::aborted("handler")) };
        let err = chain
            .intercept(
                Box::new(NullStream(RequestState::default())),
                &info,
                StreamNext::handler(&info, &handler),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
    }
}
