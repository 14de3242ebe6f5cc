//! Call logging and RPC metrics.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Instant;
use tonic::{Code, Status};

use super::interceptor::{RpcRequest, StreamInterceptor, StreamNext, UnaryInterceptor, UnaryNext};
use super::registry::MethodInfo;
use super::stream::BoxStream;

/// Outermost interceptor: one log line and one sample per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallLogger;

fn record(info: &MethodInfo, code: Code, started: Instant, peer: Option<std::net::SocketAddr>) {
    let elapsed = started.elapsed();
    let code_label = format!("{code:?}");

    metrics::counter!(
        "rpc_requests_total",
        "method" => info.full_method.clone(),
        "code" => code_label.clone()
    )
    .increment(1);
    metrics::histogram!("rpc_request_duration_seconds", "method" => info.full_method.clone())
        .record(elapsed.as_secs_f64());

    match code {
        Code::Ok => tracing::info!(
            method = %info.full_method,
            code = %code_label,
            peer = ?peer,
            duration_ms = elapsed.as_millis() as u64,
            "RPC call finished"
        ),
        Code::Internal | Code::Unknown | Code::DataLoss => tracing::error!(
            method = %info.full_method,
            code = %code_label,
            peer = ?peer,
            duration_ms = elapsed.as_millis() as u64,
            "RPC call failed"
        ),
        _ => tracing::warn!(
            method = %info.full_method,
            code = %code_label,
            peer = ?peer,
            duration_ms = elapsed.as_millis() as u64,
            "RPC call failed"
        ),
    }
}

#[async_trait]
impl UnaryInterceptor for CallLogger {
    async fn intercept(
        &self,
        request: RpcRequest,
        info: &MethodInfo,
        next: UnaryNext<'_>,
    ) -> Result<Bytes, Status> {
        let started = Instant::now();
        let peer = request.state.peer();
        let result = next.run(request).await;
        let code = result.as_ref().map_or_else(Status::code, |_| Code::Ok);
        record(info, code, started, peer);
        result
    }
}

#[async_trait]
impl StreamInterceptor for CallLogger {
    async fn intercept(
        &self,
        stream: BoxStream,
        info: &MethodInfo,
        next: StreamNext<'_>,
    ) -> Result<(), Status> {
        let started = Instant::now();
        let peer = stream.state().peer();
        let result = next.run(stream).await;
        let code = result.as_ref().map_or_else(Status::code, |_| Code::Ok);
        record(info, code, started, peer);
        result
    }
}
