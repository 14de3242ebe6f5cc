//! HTTP Basic authentication against one fixed user.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Credentials checked by [`require_basic_auth`].
///
/// ```ignore
/// let router = Router::new()
///     .route("/metrics", get(render))
///     .route_layer(from_fn_with_state(BasicAuth::new("ops", secret), require_basic_auth));
/// ```
#[derive(Clone)]
pub struct BasicAuth {
    credentials: Arc<(String, String)>,
}

impl BasicAuth {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Arc::new((user.into(), password.into())),
        }
    }

    /// Both fields are compared in constant time, and both are always
    /// compared.
    fn accepts(&self, user: &str, password: &str) -> bool {
        let (expected_user, expected_password) = &*self.credentials;
        let user_ok = user.as_bytes().ct_eq(expected_user.as_bytes());
        let password_ok = password.as_bytes().ct_eq(expected_password.as_bytes());
        (user_ok & password_ok).into()
    }
}

/// `user:password` from an `Authorization: Basic ...` header.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Reject requests whose Basic credentials do not match.
pub async fn require_basic_auth(
    State(auth): State<BasicAuth>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match basic_credentials(request.headers()) {
        Some((user, password)) if auth.accepts(&user, &password) => next.run(request).await,
        _ => {
            tracing::debug!(path = %request.uri().path(), "Basic auth rejected");
            (StatusCode::UNAUTHORIZED, "Unauthorized.\n").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware::from_fn_with_state, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/info", get(|| async { "ok" }))
            .route_layer(from_fn_with_state(BasicAuth::new("ops", "s3cret"), require_basic_auth))
    }

    fn request(authorization: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().uri("/info");
        if let Some(value) = authorization {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn basic(user: &str, password: &str) -> Option<String> {
        Some(format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))))
    }

    async fn unauthorized(response: Response) {
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Unauthorized.\n");
    }

    #[tokio::test]
    async fn matching_credentials_pass() {
        let response = app().oneshot(request(basic("ops", "s3cret"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn wrong_user_or_password_is_unauthorized() {
        for header in [basic("ops", "guess"), basic("root", "s3cret"), basic("ops", "s3cret!")] {
            unauthorized(app().oneshot(request(header)).await.unwrap()).await;
        }
    }

    #[tokio::test]
    async fn missing_or_malformed_header_is_unauthorized() {
        let malformed = [
            None,
            Some("Bearer s3cret".to_string()),
            Some("Basic not-base64!".to_string()),
            Some(format!("Basic {}", STANDARD.encode("no-colon"))),
        ];
        for header in malformed {
            unauthorized(app().oneshot(request(header)).await.unwrap()).await;
        }
    }

    #[test]
    fn password_may_contain_colons() {
        let mut headers = HeaderMap::new();
        let value = format!("basic {}", STANDARD.encode("ops:a:b"));
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        assert_eq!(
            basic_credentials(&headers),
            Some(("ops".to_string(), "a:b".to_string()))
        );
    }
}
