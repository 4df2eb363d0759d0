//! Gateway error taxonomy.

use std::io;
use std::path::PathBuf;

use edge_networking::DialError;
use thiserror::Error;

/// Startup configuration errors. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid url rule {rule}: {detail}")]
    Rule { rule: String, detail: String },

    #[error("no handler provider registered for {kind} rules")]
    MissingProvider { kind: String },

    #[error("tls configuration error: {0}")]
    Tls(String),
}

/// PROXY-protocol prefix errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyHeaderError {
    #[error("proxy v1 header exceeds 107 bytes")]
    TooLong,

    #[error("malformed proxy v1 header: {0}")]
    MalformedV1(String),

    #[error("malformed proxy v2 header: {0}")]
    MalformedV2(String),

    #[error("connection closed inside proxy header")]
    Truncated,
}

/// Per-connection handshake failures (PROXY prefix, TLS, HTTP/2 preface).
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    ProxyHeader(#[from] ProxyHeaderError),

    #[error("tls handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("http/2 handshake failed: {0}")]
    Http2(#[source] h2::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Upstream HTTP/2 session errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("invalid tls server name {0}")]
    ServerName(String),

    #[error("upstream tls handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("upstream did not negotiate h2")]
    NoH2,

    #[error("upstream http/2 handshake failed: {0}")]
    Handshake(#[source] h2::Error),

    #[error("upstream stream error: {0}")]
    Stream(#[from] h2::Error),

    #[error("upstream body error: {0}")]
    Body(String),

    #[error("liveness ping unanswered after {0:?}")]
    PingTimeout(std::time::Duration),

    #[error("upstream refused tunnel with status {0}")]
    Refused(http::StatusCode),

    #[error("upstream unavailable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Proxy forwarding and reverse-proxy errors. Rendered as `503`/`502`.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no forwarding target in request: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("tls to {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("http exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("request body error: {0}")]
    Body(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// `CONNECT` tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel target {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("tunnel io error: {0}")]
    Io(#[from] io::Error),
}

/// Digest authentication failures. All of them answer with a challenge.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no digest credentials supplied")]
    Missing,

    #[error("malformed digest credentials: {0}")]
    Malformed(&'static str),

    #[error("unknown user {user} in realm {realm}")]
    UnknownUser { user: String, realm: String },

    #[error("unknown or expired nonce")]
    StaleNonce,

    #[error("nonce count replayed")]
    Replay,

    #[error("digest response mismatch")]
    Mismatch,
}

/// A panic caught at a per-task boundary.
#[derive(Debug, Error, Clone)]
#[error("task {task} panicked: {message}")]
pub struct TaskFailure {
    pub task: &'static str,
    pub message: String,
}
