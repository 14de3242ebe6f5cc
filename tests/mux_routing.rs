//! RPC and gateway traffic sharing one plaintext listener.

use async_trait::async_trait;
use axum::{routing::post, Router};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tonic::Status;

use svcmux::lifecycle::{RpcApi, Runtime, RuntimeBuilder};
use svcmux::rpc::{BoxStream, KeepAlive, RpcRequest, RpcService};

mod common;

async fn echo(request: RpcRequest) -> Result<Bytes, Status> {
    Ok(request.message)
}

async fn shout(mut stream: BoxStream) -> Result<(), Status> {
    while let Some(message) = stream.recv().await? {
        stream.send(Bytes::from(message.to_ascii_uppercase())).await?;
    }
    Ok(())
}

async fn gateway_echo(body: Bytes) -> String {
    format!("gateway:{}", String::from_utf8_lossy(&body))
}

struct EchoApi;

#[async_trait]
impl RpcApi for EchoApi {
    fn services(&self) -> Vec<RpcService> {
        vec![RpcService::new("test.v1.Echo")
            .unary("Say", echo)
            .streaming("Shout", shout)]
    }

    fn gateway_routes(&self) -> Option<Router> {
        Some(Router::new().route("/v1/echo", post(gateway_echo)))
    }
}

fn builder() -> RuntimeBuilder {
    RuntimeBuilder::new()
        .name("mux-test")
        .bind_address("127.0.0.1:0")
        .health_address("127.0.0.1:0")
        .api(Arc::new(EchoApi))
        .gateway(true)
        .handle_signals(false)
        .phase_timeout(Duration::from_secs(5))
}

async fn started(builder: RuntimeBuilder) -> Runtime {
    let mut runtime = builder.build().unwrap();
    let _errors = runtime.start().await.unwrap();
    runtime
}

#[tokio::test]
async fn rpc_and_gateway_share_the_listener() {
    let mut runtime = started(builder()).await;
    let addr = runtime.addresses().unwrap().listener.unwrap();

    let reply = common::grpc_unary(addr, "/test.v1.Echo/Say", b"hello", None).await;
    assert_eq!(reply.code(), "0");
    assert_eq!(reply.messages, vec![Bytes::from_static(b"hello")]);

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/v1/echo"))
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "gateway:ping");

    let report = runtime.stop().await;
    assert!(report.is_clean(), "{:?}", report.failed);
    assert!(report.completed.contains(&"rpc server"));
    assert!(report.completed.contains(&"gateway server"));
}

#[tokio::test]
async fn streaming_call_echoes_every_message() {
    let mut runtime = started(builder()).await;
    let addr = runtime.addresses().unwrap().listener.unwrap();

    let tcp = TcpStream::connect(addr).await.unwrap();
    let reply = common::try_grpc_call(tcp, "/test.v1.Echo/Shout", &[b"one", b"two"], None)
        .await
        .unwrap();
    assert_eq!(reply.code(), "0");
    assert_eq!(
        reply.messages,
        vec![Bytes::from_static(b"ONE"), Bytes::from_static(b"TWO")]
    );

    runtime.stop().await;
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let mut runtime = started(builder()).await;
    let addr = runtime.addresses().unwrap().listener.unwrap();

    let reply = common::grpc_unary(addr, "/test.v1.Echo/Missing", b"", None).await;
    assert_eq!(reply.code(), "12");

    runtime.stop().await;
}

#[tokio::test]
async fn health_and_debug_endpoints_are_served() {
    let mut runtime = started(builder().debug("127.0.0.1:0").tag("region", "eu-west")).await;
    let addrs = runtime.addresses().unwrap().clone();
    let client = reqwest::Client::new();

    for path in ["/live", "/ready"] {
        let response = client
            .get(format!("http://{}{path}", addrs.health))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "{path}");
    }

    let response = client
        .get(format!("http://{}/info", addrs.debug.unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    let page = response.text().await.unwrap();
    assert!(page.contains("Server Tags"));
    assert!(page.contains("eu-west"));

    let report = runtime.stop().await;
    assert!(report.completed.contains(&"health server"));
    assert!(report.completed.contains(&"debug server"));
}

#[tokio::test]
async fn unresponsive_rpc_peer_is_disconnected() {
    let mut runtime = started(builder().rpc_keep_alive(KeepAlive {
        interval: Some(Duration::from_millis(100)),
        timeout: Duration::from_millis(100),
    }))
    .await;
    let addr = runtime.addresses().unwrap().listener.unwrap();

    let mut tcp = common::silent_h2_peer(addr).await;
    let mut sink = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), tcp.read_to_end(&mut sink)).await;
    assert!(closed.is_ok(), "server kept the dead connection open");

    runtime.stop().await;
}
