//! Shared utilities for integration tests: a throwaway PKI, a fake token
//! verifier and a minimal RPC client speaking HTTP/2 directly.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rcgen::{BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use svcmux::auth::{BoxError, IdToken, TokenVerifier};
use svcmux::net::ServerTls;

/// A CA plus one server and one client certificate it signed.
pub struct TestPki {
    ca: CertificateDer<'static>,
    server_cert_pem: String,
    server_key_pem: String,
    ca_pem: String,
    client_cert: CertificateDer<'static>,
    client_key: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Self {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_key = KeyPair::generate().unwrap();
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let mut client_params = CertificateParams::new(vec!["client.test".to_string()]).unwrap();
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_key = KeyPair::generate().unwrap();
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        Self {
            ca: ca.der().clone(),
            server_cert_pem: server.pem(),
            server_key_pem: server_key.serialize_pem(),
            ca_pem: ca.pem(),
            client_cert: client.der().clone(),
            client_key: client_key.serialize_der(),
        }
    }

    /// Server side TLS, requiring client certificates when `mutual`.
    pub fn server_tls(&self, mutual: bool) -> ServerTls {
        let ca = mutual.then_some(self.ca_pem.as_bytes());
        ServerTls::from_pem(self.server_cert_pem.as_bytes(), self.server_key_pem.as_bytes(), ca)
            .unwrap()
    }

    /// Client trusting the test CA, offering `alpn`, with or without a
    /// client certificate.
    pub fn client_config(&self, with_cert: bool, alpn: &[&[u8]]) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.clone()).unwrap();
        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);

        let mut config = if with_cert {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_key.clone()));
            builder
                .with_client_auth_cert(vec![self.client_cert.clone()], key)
                .unwrap()
        } else {
            builder.with_no_client_auth()
        };
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }
}

/// Open a TLS connection to `addr`, verifying the server as `localhost`.
pub async fn tls_connect(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>, BoxError> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from("localhost")?;
    Ok(TlsConnector::from(config).connect(name, tcp).await?)
}

/// Accepts any token whose text is a JSON claim set.
pub struct JsonVerifier;

#[async_trait]
impl TokenVerifier for JsonVerifier {
    async fn verify(&self, token: &str) -> Result<IdToken, BoxError> {
        IdToken::from_payload(serde_json::from_str(token)?)
    }
}

pub const ISSUER: &str = "https://issuer.example";
pub const AUDIENCE: &str = "my-service";

/// A token for alice expiring `exp_offset` seconds from now.
pub fn token(exp_offset: i64) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    serde_json::json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "u-1",
        "email": "alice@example.com",
        "exp": now + exp_offset,
    })
    .to_string()
}

/// Length-prefixed RPC message.
pub fn grpc_frame(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + message.len());
    buf.extend_from_slice(&[0]);
    buf.extend_from_slice(&(message.len() as u32).to_be_bytes());
    buf.extend_from_slice(message);
    buf.freeze()
}

/// What an RPC call came back with.
#[derive(Debug)]
pub struct GrpcReply {
    pub http_status: StatusCode,
    pub status: Option<String>,
    pub message: Option<String>,
    pub messages: Vec<Bytes>,
}

impl GrpcReply {
    pub fn code(&self) -> &str {
        self.status.as_deref().unwrap_or("")
    }
}

fn decode_frames(mut body: Bytes) -> Vec<Bytes> {
    let mut messages = Vec::new();
    while body.len() >= 5 {
        body.advance(1);
        let len = body.get_u32() as usize;
        if body.len() < len {
            break;
        }
        messages.push(body.split_to(len));
    }
    messages
}

fn header(trailers: Option<&HeaderMap>, headers: &HeaderMap, name: &str) -> Option<String> {
    trailers
        .and_then(|t| t.get(name))
        .or_else(|| headers.get(name))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Send one request of `messages` to `path` over `io` using HTTP/2.
pub async fn try_grpc_call<S>(
    io: S,
    path: &str,
    messages: &[&[u8]],
    token: Option<&str>,
) -> Result<GrpcReply, BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
    tokio::spawn(conn);

    let mut body = BytesMut::new();
    for message in messages {
        body.extend_from_slice(&grpc_frame(message));
    }
    let mut request = Request::post(format!("http://localhost{path}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers");
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    let request = request.body(Full::new(body.freeze()))?;

    let response = sender.send_request(request).await?;
    let http_status = response.status();
    let headers = response.headers().clone();
    let collected = response.into_body().collect().await?;
    let trailers = collected.trailers().cloned();
    let messages = decode_frames(collected.to_bytes());

    Ok(GrpcReply {
        http_status,
        status: header(trailers.as_ref(), &headers, "grpc-status"),
        message: header(trailers.as_ref(), &headers, "grpc-message"),
        messages,
    })
}

/// Unary call over plaintext HTTP/2.
pub async fn grpc_unary(addr: SocketAddr, path: &str, message: &[u8], token: Option<&str>) -> GrpcReply {
    let tcp = TcpStream::connect(addr).await.unwrap();
    try_grpc_call(tcp, path, &[message], token).await.unwrap()
}

/// An HTTP/2 client that sends the preface and an empty SETTINGS frame,
/// waits for the server's first frame and then goes silent. It never acks
/// anything, so pings and GOAWAY handshakes stall.
pub async fn silent_h2_peer(addr: SocketAddr) -> TcpStream {
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await.unwrap();
    tcp.write_all(&[0, 0, 0, 4, 0, 0, 0, 0, 0]).await.unwrap();
    let mut first = [0u8; 9];
    tokio::time::timeout(Duration::from_secs(5), tcp.read_exact(&mut first))
        .await
        .unwrap()
        .unwrap();
    tcp
}

/// Minimal HTTP/1.1 exchange over any stream: returns the status line and
/// the body.
pub async fn http1_request<S>(mut io: S, method: &str, path: &str, body: &str) -> (String, String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    io.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), io.read_to_end(&mut raw)).await;
    let text = String::from_utf8_lossy(&raw).to_string();
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((&text, ""));
    let status = head.lines().next().unwrap_or_default().to_string();
    (status, body.to_string())
}
