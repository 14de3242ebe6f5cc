//! Bearer token middleware for HTTP routes.

use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{request::Parts, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::{bearer_from_headers, AuthError, AuthRuntime, RawRequest, RequestState};
use crate::mux::ConnInfo;
use crate::rpc::AuthzRule;

/// State for [`require_auth`]: the runtime and the rule the routes are
/// authorized against.
///
/// ```ignore
/// let router = Router::new()
///     .route("/docs", get(list_docs))
///     .route_layer(from_fn_with_state(HttpAuth::new(runtime).rule("doc", "read"), require_auth));
/// ```
#[derive(Clone)]
pub struct HttpAuth {
    runtime: Arc<dyn AuthRuntime>,
    rule: Option<AuthzRule>,
}

impl HttpAuth {
    pub fn new(runtime: Arc<dyn AuthRuntime>) -> Self {
        Self { runtime, rule: None }
    }

    /// Authorize requests against `resource`/`action`. Without a rule the
    /// empty pair is used.
    pub fn rule(mut self, resource: impl Into<String>, action: impl Into<String>) -> Self {
        self.rule = Some(AuthzRule::new(resource, action));
        self
    }

    async fn admit(
        &self,
        state: RequestState,
        token: String,
        raw: RawRequest,
    ) -> Result<RequestState, AuthError> {
        let (state, claims) = self.runtime.verify(state, &token).await?;

        let (resource, action) = match &self.rule {
            Some(rule) => (rule.resource.as_str(), rule.action.as_str()),
            None => ("", ""),
        };
        let (state, result) = self
            .runtime
            .authorize(state, claims, resource, action, &raw)
            .await?;

        if !result.allowed {
            tracing::info!(
                subject = %state.current_user(),
                resource,
                action,
                "Permission denied"
            );
            return Err(AuthError::PermissionDenied);
        }
        Ok(state)
    }
}

/// Request state for `request` before any auth phase ran.
fn initial_state(request: &Request<Body>, cancel: CancellationToken) -> RequestState {
    let mut state = RequestState::from_headers(request.headers().clone()).with_cancellation(cancel);
    if let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        state = state.with_peer(*peer);
    }
    if let Some(info) = request.extensions().get::<ConnInfo>() {
        state = state.with_secure(info.is_secure());
    }
    state
}

/// Reject requests without a valid, authorized bearer token. On success the
/// resulting [`RequestState`] is stored in the request extensions.
pub async fn require_auth(
    State(auth): State<HttpAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let cancel = CancellationToken::new();
    let _cancel_on_exit = cancel.clone().drop_guard();

    let token = match bearer_from_headers(request.headers()) {
        Ok(token) => token.to_owned(),
        Err(e) => {
            tracing::debug!(path = %request.uri().path(), error = %e, "HTTP request rejected");
            return e.into_response();
        }
    };
    let state = initial_state(&request, cancel);
    let raw = RawRequest::Http {
        method: request.method().clone(),
        uri: request.uri().clone(),
        headers: request.headers().clone(),
    };

    match auth.admit(state, token, raw).await {
        Ok(state) => {
            request.extensions_mut().insert(state);
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!(path = %request.uri().path(), error = %e, "HTTP request rejected");
            e.into_response()
        }
    }
}

/// Handlers behind [`require_auth`] get the admitted state; elsewhere an
/// anonymous state built from the request headers.
impl<S> FromRequestParts<S> for RequestState
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestState>()
            .cloned()
            .unwrap_or_else(|| RequestState::from_headers(parts.headers.clone())))
    }
}
