//! Service runtime that serves RPC and HTTP/1.1 gateway traffic on one
//! listener.
//!
//! Connections are classified by their first bytes (`mux`), optionally
//! TLS-terminated on the way, and handed to the RPC server or the gateway.
//! Every RPC passes through logging and token-based auth interceptors
//! (`rpc`, `auth`). The `lifecycle` runtime also serves a standalone HTTP
//! API, health endpoints and a debug page, and shuts everything down in a
//! fixed order.

pub mod auth;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod mux;
pub mod net;
pub mod observability;
pub mod rpc;

pub use config::schema::RuntimeConfig;
pub use http::HttpServer;
pub use lifecycle::{Runtime, RuntimeBuilder, Shutdown};
pub use rpc::{RpcServer, RpcService};
