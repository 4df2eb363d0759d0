//! Error types for resolution and dialing.

use std::io;

use thiserror::Error;

/// DNS resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The hostname could not be encoded as a DNS name.
    #[error("invalid hostname {host}: {detail}")]
    InvalidName { host: String, detail: String },

    /// Every attempt against a server timed out.
    #[error("dns query to {server} timed out")]
    Timeout { server: String },

    /// Socket-level failure talking to a server.
    #[error("dns transport error: {0}")]
    Io(#[from] io::Error),

    /// A reply could not be decoded or did not match the query.
    #[error("dns protocol error: {0}")]
    Protocol(String),

    /// The query was answered but carried no usable address.
    #[error("dns lookup failed for {host}: no records")]
    NoRecords { host: String },

    /// No DNS servers are configured.
    #[error("no dns servers configured")]
    NoServers,
}

impl From<hickory_proto::error::ProtoError> for ResolveError {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        ResolveError::Protocol(e.to_string())
    }
}

/// Outbound dial errors.
#[derive(Debug, Error)]
pub enum DialError {
    /// The address is not in `host:port` form.
    #[error("invalid address {0}")]
    InvalidAddress(String),

    /// Resolution of the host failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Connecting to a candidate address failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Connecting to a candidate address timed out.
    #[error("connect to {addr} timed out")]
    Timeout { addr: std::net::SocketAddr },
}

impl DialError {
    /// Short reason code used in logs and plaintext error bodies.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DialError::InvalidAddress(_) => "invalid_address",
            DialError::Resolve(_) => "resolve_failed",
            DialError::Connect { .. } => "connect_failed",
            DialError::Timeout { .. } => "connect_timeout",
        }
    }
}
