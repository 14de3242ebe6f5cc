//! Per-call authentication and authorization for RPC methods.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tonic::Status;

use super::interceptor::{RpcRequest, StreamInterceptor, StreamNext, UnaryInterceptor, UnaryNext};
use super::registry::MethodInfo;
use super::stream::{wrap_stream, BoxStream};
use crate::auth::{bearer_from_metadata, AuthError, AuthRuntime, RawRequest, RequestState};

/// Verifies the caller's bearer token and authorizes the method's
/// resource/action before letting the call through.
#[derive(Clone)]
pub struct AuthInterceptor {
    runtime: Arc<dyn AuthRuntime>,
}

impl AuthInterceptor {
    pub fn new(runtime: Arc<dyn AuthRuntime>) -> Self {
        Self { runtime }
    }

    async fn admit(
        &self,
        state: RequestState,
        info: &MethodInfo,
        raw: RawRequest,
    ) -> Result<RequestState, AuthError> {
        let token = bearer_from_metadata(state.metadata())?.to_owned();
        let (state, claims) = self.runtime.verify(state, &token).await?;

        let (resource, action) = info.resource_action();
        let (state, result) = self
            .runtime
            .authorize(state, claims, resource, action, &raw)
            .await?;

        if result.allowed {
            Ok(state)
        } else {
            tracing::info!(
                method = %info.full_method,
                subject = %state.current_user(),
                resource,
                action,
                "Permission denied"
            );
            Err(AuthError::PermissionDenied)
        }
    }
}

#[async_trait]
impl UnaryInterceptor for AuthInterceptor {
    async fn intercept(
        &self,
        request: RpcRequest,
        info: &MethodInfo,
        next: UnaryNext<'_>,
    ) -> Result<Bytes, Status> {
        let raw = RawRequest::rpc(info.full_method.clone(), Some(request.message.clone()));
        let state = self.admit(request.state, info, raw).await?;
        next.run(RpcRequest {
            state,
            message: request.message,
        })
        .await
    }
}

#[async_trait]
impl StreamInterceptor for AuthInterceptor {
    async fn intercept(
        &self,
        stream: BoxStream,
        info: &MethodInfo,
        next: StreamNext<'_>,
    ) -> Result<(), Status> {
        let raw = RawRequest::rpc(info.full_method.clone(), None);
        let state = self.admit(stream.state().clone(), info, raw).await?;
        next.run(wrap_stream(stream, state)).await
    }
}
