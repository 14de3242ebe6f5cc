//! Auth error taxonomy and its mapping onto RPC and HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tonic::{Code, Status};

/// Boxed error returned by pluggable collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the auth pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Missing, malformed, expired or otherwise invalid token.
    #[error("{0}")]
    Unauthenticated(String),
    /// The decision function said no.
    #[error("contact system administrator")]
    PermissionDenied,
    /// A resolver or the decision function itself failed.
    #[error("{stage} failed: {source}")]
    Resolver {
        stage: &'static str,
        #[source]
        source: BoxError,
    },
    /// The caller went away while the pipeline was running.
    #[error("request cancelled")]
    Cancelled,
    /// The runtime was built with invalid options.
    #[error("invalid auth configuration: {0}")]
    Config(String),
}

impl AuthError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        AuthError::Unauthenticated(msg.into())
    }

    pub(crate) fn resolver(stage: &'static str, source: BoxError) -> Self {
        AuthError::Resolver { stage, source }
    }

    /// RPC status code for this error.
    pub fn code(&self) -> Code {
        match self {
            AuthError::Unauthenticated(_) => Code::Unauthenticated,
            AuthError::PermissionDenied => Code::PermissionDenied,
            AuthError::Resolver { .. } | AuthError::Config(_) => Code::Internal,
            AuthError::Cancelled => Code::Cancelled,
        }
    }

    /// HTTP status for this error.
    pub fn http_status(&self) -> StatusCode {
        match self {
            AuthError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AuthError::PermissionDenied => StatusCode::FORBIDDEN,
            AuthError::Resolver { .. } | AuthError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AuthError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = match status {
            StatusCode::UNAUTHORIZED => "Unauthorized.\n",
            StatusCode::FORBIDDEN => "Forbidden.\n",
            StatusCode::REQUEST_TIMEOUT => "Request cancelled.\n",
            _ => "Internal server error.\n",
        };
        (status, body).into_response()
    }
}
