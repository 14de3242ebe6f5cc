//! RPC serving over HTTP/2.
//!
//! # Data Flow
//! ```text
//! VirtualListener → RpcServer (hyper h2) → registry lookup
//!     → CallLogger → AuthInterceptor → user interceptors → handler
//! ```
//!
//! Messages use the gRPC length-prefixed framing and errors travel as
//! `grpc-status` trailers, so standard gRPC clients can call these services.
//! Message bodies are opaque bytes; (de)serialization is left to handlers.

pub mod auth;
pub mod codec;
pub mod interceptor;
pub mod logging;
pub mod registry;
pub mod server;
pub mod stream;

pub use auth::AuthInterceptor;
pub use interceptor::{
    chain_stream, chain_unary, Passthrough, RpcRequest, StreamHandler, StreamInterceptor,
    StreamNext, UnaryHandler, UnaryInterceptor, UnaryNext,
};
pub use logging::CallLogger;
pub use registry::{AuthzRule, MethodInfo, MethodKind, MethodRegistry, RegistryError, RpcService};
pub use server::{KeepAlive, RpcBody, RpcServer, RpcServerBuilder, ServeError};
pub use stream::{wrap_stream, BoxStream, ChannelStream, ServerStream, WrappedStream};
