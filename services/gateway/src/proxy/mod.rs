//! Connection handling: from accepted socket to routed request.
//!
//! This module provides:
//! - PROXY protocol prefix detection
//! - TLS termination and ALPN protocol selection
//! - HTTP/1.1 and HTTP/2 server drivers
//! - `CONNECT` tunnel plumbing
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> ClassifiedStream -> TlsProvider -+-> http1 (ResponseWriter) -+-> Router
//!                       (PROXY v1/v2)       (ALPN)       +-> http2 (one task/stream) -+
//! ```

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod h2io;
pub mod http1;
pub mod http2;
pub mod listener;
pub mod proxy_protocol;
pub mod tls;
pub mod tunnel;

pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use proxy_protocol::{ClassifiedStream, ProxyHeader};
pub use tls::{CertificateSet, RustlsProvider, TlsProvider, TlsSession};
pub use tunnel::{Hijack, TunnelManager};

/// Byte stream the protocol drivers run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedIo = Box<dyn Io>;

/// Client address as seen after PROXY-header decoding. Set on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// The raw HTTP/1.x request-target, exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget(pub String);
