//! Edge gateway.
//!
//! Terminates TCP/TLS connections (with an optional PROXY-protocol prefix),
//! negotiates HTTP/1.1 or HTTP/2 over ALPN, and routes each request either to
//! local content or out through the proxy path: direct or parent-proxy
//! forwarding and `CONNECT` tunnels.

pub mod auth;
pub mod body;
pub mod config;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod handlers;
pub mod proxy;
pub mod router;
pub mod task;
pub mod upstream;

pub use auth::{CredentialLookup, DigestAuth, HtdigestFile};
pub use config::{Config, FileConfig};
pub use forward::{DirectForwarder, Forwarder, ParentForwarder};
pub use gateway::Gateway;
pub use proxy::{
    CertificateSet, ClassifiedStream, Hijack, Listener, ListenerConfig, ListenerStats,
    ProxyHeader, RustlsProvider, TlsProvider, TlsSession, TunnelManager,
};
pub use router::{Handler, HandlerProvider, ProxyServices, Router};
pub use upstream::{Session, UpstreamPool, UpstreamTarget};
