//! Pluggable collaborators consulted during authorization.
//!
//! Each trait has a blanket impl for async closures taking owned
//! arguments, so simple deployments can pass a closure.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;

use super::context::RequestState;
use super::error::BoxError;
use super::runtime::{AuthorizationRequest, AuthorizationResult};

/// The request being authorized, as seen by a [`ResourceIdentifier`].
#[derive(Debug, Clone)]
pub enum RawRequest {
    /// An RPC call. `message` is absent for streaming calls.
    Rpc {
        method: String,
        message: Option<Bytes>,
    },
    /// An HTTP request; the body is not buffered.
    Http {
        method: http::Method,
        uri: http::Uri,
        headers: http::HeaderMap,
    },
}

impl RawRequest {
    pub fn rpc(method: impl Into<String>, message: Option<Bytes>) -> Self {
        RawRequest::Rpc {
            method: method.into(),
            message,
        }
    }
}

/// The decision function.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        state: &RequestState,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationResult, BoxError>;
}

/// Maps a subject to the roles bound to it.
#[async_trait]
pub trait RoleBindingResolver: Send + Sync {
    async fn role_bindings(&self, state: &RequestState, subject: &str) -> Result<Vec<String>, BoxError>;
}

/// Lookup key for [`ResourceResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuery {
    pub subject: String,
    pub resource: String,
    pub action: String,
    pub resource_id: String,
}

/// Returns attributes of the resource being accessed.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(
        &self,
        state: &RequestState,
        query: &ResourceQuery,
    ) -> Result<HashMap<String, String>, BoxError>;
}

/// Picks the target resource id out of an incoming request.
#[async_trait]
pub trait ResourceIdentifier: Send + Sync {
    async fn identify(&self, state: &RequestState, request: &RawRequest) -> Result<String, BoxError>;
}

#[async_trait]
impl<F, Fut> Authorizer for F
where
    F: Fn(AuthorizationRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AuthorizationResult, BoxError>> + Send,
{
    async fn authorize(
        &self,
        _state: &RequestState,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizationResult, BoxError> {
        (self)(request.clone()).await
    }
}

#[async_trait]
impl<F, Fut> RoleBindingResolver for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<String>, BoxError>> + Send,
{
    async fn role_bindings(&self, _state: &RequestState, subject: &str) -> Result<Vec<String>, BoxError> {
        (self)(subject.to_string()).await
    }
}

#[async_trait]
impl<F, Fut> ResourceResolver for F
where
    F: Fn(ResourceQuery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HashMap<String, String>, BoxError>> + Send,
{
    async fn resolve(
        &self,
        _state: &RequestState,
        query: &ResourceQuery,
    ) -> Result<HashMap<String, String>, BoxError> {
        (self)(query.clone()).await
    }
}

#[async_trait]
impl<F, Fut> ResourceIdentifier for F
where
    F: Fn(RawRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, BoxError>> + Send,
{
    async fn identify(&self, _state: &RequestState, request: &RawRequest) -> Result<String, BoxError> {
        (self)(request.clone()).await
    }
}
