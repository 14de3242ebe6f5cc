//! HTTP serving: gateway, API and debug routers.
//!
//! # Data Flow
//! ```text
//! mux HTTP/1.1 branch or dedicated TCP listener
//!     → server.rs (hyper auto connection, tower-http stack)
//!     → middleware/auth.rs (bearer token, optional)
//!     → application router
//! ```

pub mod debug;
pub mod middleware;
pub mod server;

pub use debug::{debug_router, ServerInfo};
pub use middleware::{require_auth, require_basic_auth, BasicAuth, HttpAuth};
pub use server::{HttpServer, X_REQUEST_ID};
