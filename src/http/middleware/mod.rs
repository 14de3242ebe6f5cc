//! Axum middleware.

pub mod auth;
pub mod basic;

pub use auth::{require_auth, HttpAuth};
pub use basic::{require_basic_auth, BasicAuth};
