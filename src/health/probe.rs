//! Health probe seam.

use async_trait::async_trait;
use std::future::Future;

use crate::auth::BoxError;

/// A readiness check polled by the health service.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> Probe for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn check(&self) -> Result<(), BoxError> {
        self().await
    }
}
