//! Authentication and authorization.
//!
//! # Data Flow
//! ```text
//! RPC metadata / HTTP header
//!     → token.rs (exactly one `Bearer <token>`)
//!     → runtime.rs verify (verifier.rs seam, claims.rs)
//!     → runtime.rs authorize (resolvers.rs seams)
//!     → context.rs RequestState carrying Authenticated / Authorized
//! ```
//!
//! # Design Decisions
//! - Crypto and policy are collaborators behind traits
//! - Request state is an immutable value, each phase returns a new one
//! - Errors are classified once, mapped at the middleware boundary

pub mod claims;
pub mod context;
pub mod error;
pub mod resolvers;
pub mod runtime;
pub mod token;
pub mod verifier;

pub use claims::Claims;
pub use context::{Authenticated, Authorized, RequestState, ANONYMOUS};
pub use error::{AuthError, BoxError};
pub use resolvers::{
    Authorizer, RawRequest, ResourceIdentifier, ResourceQuery, ResourceResolver,
    RoleBindingResolver,
};
pub use runtime::{
    AuthRuntime, AuthService, AuthServiceBuilder, AuthorizationData, AuthorizationRequest,
    AuthorizationResult,
};
pub use token::{bearer_from_headers, bearer_from_metadata};
pub use verifier::{IdToken, TokenVerifier};
