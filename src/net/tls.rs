//! TLS configuration and certificate loading.
//!
//! Builds the rustls server configuration used by the TLS node of the
//! listener tree. When a client CA is supplied the server requires and
//! verifies client certificates (mutual TLS).

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// ALPN protocols offered to clients. h2 first so RPC clients negotiate HTTP/2.
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Error type for TLS setup.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid PEM data in {what}: {source}")]
    Pem {
        what: String,
        #[source]
        source: std::io::Error,
    },
    #[error("client CA rejected: {0}")]
    ClientCa(String),
    #[error("rustls configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// PEM material for the server side of a TLS listener.
#[derive(Clone)]
pub struct ServerTls {
    certs: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
    client_ca: Option<Vec<CertificateDer<'static>>>,
}

impl std::fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTls")
            .field("certs", &self.certs.len())
            .field("mutual", &self.client_ca.is_some())
            .finish()
    }
}

impl ServerTls {
    /// Load certificate chain, private key and optional client CA bundle from disk.
    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        client_ca_path: Option<&Path>,
    ) -> Result<Self, TlsError> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        let ca_pem = client_ca_path.map(read_file).transpose()?;

        tracing::info!(
            cert_file = %cert_path.display(),
            key_file = %key_path.display(),
            client_ca = ?client_ca_path.map(|p| p.display().to_string()),
            "Loading TLS material"
        );

        Self::from_pem(&cert_pem, &key_pem, ca_pem.as_deref())
    }

    /// Build from in-memory PEM data.
    pub fn from_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
        client_ca_pem: Option<&[u8]>,
    ) -> Result<Self, TlsError> {
        let certs = parse_certs(cert_pem, "certificate")?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|source| TlsError::Pem {
                what: "private key".into(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey("private key".into()))?;
        let client_ca = client_ca_pem
            .map(|pem| parse_certs(pem, "client CA"))
            .transpose()?;

        Ok(Self {
            certs,
            key: Arc::new(key),
            client_ca,
        })
    }

    /// Whether client certificates are required.
    pub fn is_mutual(&self) -> bool {
        self.client_ca.is_some()
    }

    /// Build the rustls server configuration.
    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let mut config = match &self.client_ca {
            Some(cas) => {
                let verifier = client_verifier(cas, provider)?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(self.certs.clone(), self.key.clone_key())?
            }
            None => {
                tracing::info!("mTLS not enabled");
                builder
                    .with_no_client_auth()
                    .with_single_cert(self.certs.clone(), self.key.clone_key())?
            }
        };

        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }

    /// Build a tokio acceptor for the TLS node of a listener tree.
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }
}

fn client_verifier(
    cas: &[CertificateDer<'static>],
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, TlsError> {
    let mut roots = RootCertStore::empty();
    for ca in cas {
        roots
            .add(ca.clone())
            .map_err(|e| TlsError::ClientCa(e.to_string()))?;
    }
    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| TlsError::ClientCa(e.to_string()))
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            what: what.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what.to_string()));
    }
    Ok(certs)
}
