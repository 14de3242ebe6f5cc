//! Request-scoped state threaded through the admission pipeline.
//!
//! A [`RequestState`] is never mutated. Each phase that succeeds returns a
//! new value with its record attached, so an interceptor can only see what
//! the phases before it produced.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;

use super::claims::Claims;

/// Subject reported when no authentication has happened.
pub const ANONYMOUS: &str = "anonymous";

/// Result of a successful token verification.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub subject: String,
    pub claims: Arc<Claims>,
}

/// Result of a successful authorization.
#[derive(Debug, Clone, Default)]
pub struct Authorized {
    pub roles: BTreeSet<String>,
}

/// Call metadata, peer details, cancellation and auth records for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    metadata: Arc<MetadataMap>,
    peer: Option<SocketAddr>,
    secure: bool,
    cancel: CancellationToken,
    authenticated: Option<Arc<Authenticated>>,
    authorized: Option<Arc<Authorized>>,
}

impl RequestState {
    pub fn new(metadata: MetadataMap) -> Self {
        Self {
            metadata: Arc::new(metadata),
            ..Self::default()
        }
    }

    /// Build from HTTP headers.
    pub fn from_headers(headers: http::HeaderMap) -> Self {
        Self::new(MetadataMap::from_headers(headers))
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_authenticated(mut self, authenticated: Authenticated) -> Self {
        self.authenticated = Some(Arc::new(authenticated));
        self
    }

    pub fn with_authorized(mut self, authorized: Authorized) -> Self {
        self.authorized = Some(Arc::new(authorized));
        self
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether the request arrived over TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn authenticated(&self) -> Option<&Authenticated> {
        self.authenticated.as_deref()
    }

    pub fn authorized(&self) -> Option<&Authorized> {
        self.authorized.as_deref()
    }

    /// The resolved subject, or [`ANONYMOUS`].
    pub fn current_user(&self) -> &str {
        self.authenticated
            .as_deref()
            .map(|a| a.subject.as_str())
            .unwrap_or(ANONYMOUS)
    }

    pub fn claims(&self) -> Option<&Arc<Claims>> {
        self.authenticated.as_deref().map(|a| &a.claims)
    }

    /// Roles granted by authorization. Empty until authorization succeeds.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.authorized
            .as_deref()
            .into_iter()
            .flat_map(|a| a.roles.iter().map(String::as_str))
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.authorized
            .as_deref()
            .is_some_and(|a| a.roles.contains(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_anonymous_without_roles() {
        let state = RequestState::default();
        assert_eq!(state.current_user(), ANONYMOUS);
        assert_eq!(state.roles().count(), 0);
        assert!(state.authenticated().is_none());
    }

    #[test]
    fn attaching_records_leaves_original_untouched() {
        let base = RequestState::default();
        let authed = base.clone().with_authenticated(Authenticated {
            subject: "alice@example.com".into(),
            claims: Arc::new(Claims::default()),
        });
        let authz = authed.clone().with_authorized(Authorized {
            roles: ["admin".to_string()].into_iter().collect(),
        });

        assert_eq!(base.current_user(), ANONYMOUS);
        assert_eq!(authed.current_user(), "alice@example.com");
        assert!(!authed.has_role("admin"));
        assert!(authz.has_role("admin"));
    }

    #[test]
    fn headers_become_metadata() {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        let state = RequestState::from_headers(headers);
        assert_eq!(
            state.metadata().get("authorization").unwrap().to_str().unwrap(),
            "Bearer abc"
        );
    }
}
