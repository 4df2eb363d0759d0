//! TLS termination.
//!
//! [`TlsProvider`] is the seam between the connection driver and the TLS
//! library: it performs the server handshake and reports the negotiated
//! ALPN protocol. [`RustlsProvider`] is the rustls implementation, offering
//! `h2` and `http/1.1` and picking a certificate by SNI from a
//! [`CertificateSet`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::BoxedIo;
use crate::error::{ConfigError, HandshakeError};

/// ALPN identifier for HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";

/// ALPN identifier for HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// A completed server handshake.
pub struct TlsSession {
    /// Decrypted application stream.
    pub io: BoxedIo,
    /// Negotiated ALPN protocol, if any.
    pub alpn: Option<Vec<u8>>,
    /// SNI name the client asked for.
    pub server_name: Option<String>,
}

impl TlsSession {
    pub fn is_h2(&self) -> bool {
        self.alpn.as_deref() == Some(ALPN_H2)
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSession")
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Server-side TLS handshake capability.
#[async_trait]
pub trait TlsProvider: Send + Sync {
    async fn accept(&self, io: BoxedIo) -> Result<TlsSession, HandshakeError>;
}

/// Certificates for one listener, selected by SNI.
///
/// The first certificate added is served when the client sends no SNI or
/// an unknown name.
#[derive(Default)]
pub struct CertificateSet {
    default: Option<Arc<CertifiedKey>>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl fmt::Debug for CertificateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("CertificateSet")
            .field("names", &names)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl CertificateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none()
    }

    /// Register `key` for `hostname`. `*.example.com` matches one label.
    pub fn add(&mut self, hostname: &str, key: Arc<CertifiedKey>) {
        if self.default.is_none() {
            self.default = Some(Arc::clone(&key));
        }
        self.by_name.insert(hostname.to_ascii_lowercase(), key);
    }

    /// Load a PEM certificate chain and private key from disk.
    pub fn load_pem(cert: &Path, key: &Path) -> Result<Arc<CertifiedKey>, ConfigError> {
        let cert_pem = std::fs::read(cert).map_err(|source| ConfigError::Read {
            path: cert.to_path_buf(),
            source,
        })?;
        let key_pem = std::fs::read(key).map_err(|source| ConfigError::Read {
            path: key.to_path_buf(),
            source,
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Build a certified key from PEM bytes.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<CertifiedKey>, ConfigError> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<_, _>>()
            .map_err(|e| ConfigError::Tls(format!("bad certificate pem: {e}")))?;
        if certs.is_empty() {
            return Err(ConfigError::Tls("no certificates found".into()));
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| ConfigError::Tls(format!("bad private key pem: {e}")))?
            .ok_or_else(|| ConfigError::Tls("no private key found".into()))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| ConfigError::Tls(format!("unsupported private key: {e}")))?;

        Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
    }

    fn lookup(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let name = name.to_ascii_lowercase();
        if let Some(key) = self.by_name.get(&name) {
            return Some(Arc::clone(key));
        }
        let (_, parent) = name.split_once('.')?;
        self.by_name.get(&format!("*.{parent}")).cloned()
    }
}

impl ResolvesServerCert for CertificateSet {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        client_hello
            .server_name()
            .and_then(|name| self.lookup(name))
            .or_else(|| self.default.clone())
    }
}

/// rustls-backed [`TlsProvider`].
#[derive(Clone)]
pub struct RustlsProvider {
    acceptor: TlsAcceptor,
}

impl RustlsProvider {
    /// Server config offering `h2` and `http/1.1` with SNI certificate selection.
    pub fn new(certs: CertificateSet) -> Result<Self, ConfigError> {
        if certs.is_empty() {
            return Err(ConfigError::Tls("listener has no certificates".into()));
        }

        let mut config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| ConfigError::Tls(e.to_string()))?
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(certs));
        config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];

        Ok(Self::from_server_config(Arc::new(config)))
    }

    pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

#[async_trait]
impl TlsProvider for RustlsProvider {
    async fn accept(&self, io: BoxedIo) -> Result<TlsSession, HandshakeError> {
        let stream = self.acceptor.accept(io).await.map_err(HandshakeError::Tls)?;

        let (_, conn) = stream.get_ref();
        let alpn = conn.alpn_protocol().map(<[u8]>::to_vec);
        let server_name = conn.server_name().map(str::to_string);
        debug!(
            alpn = ?alpn.as_deref().map(String::from_utf8_lossy),
            sni = server_name.as_deref().unwrap_or("<none>"),
            "TLS handshake complete"
        );

        Ok(TlsSession {
            io: Box::new(stream),
            alpn,
            server_name,
        })
    }
}
