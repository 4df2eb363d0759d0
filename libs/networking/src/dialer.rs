//! Resolution-aware outbound TCP dialing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::DialError;
use crate::resolver::Resolver;

/// Per-address connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connects to `host:port` targets, resolving names through a [`Resolver`].
#[derive(Debug, Clone)]
pub struct Dialer {
    resolver: Arc<Resolver>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self {
            resolver,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Dial a `host:port` (or `[v6]:port`) address.
    ///
    /// A literal IP connects directly without touching the resolver.
    pub async fn dial(&self, addr: &str) -> Result<TcpStream, DialError> {
        let (host, port) =
            split_host_port(addr).ok_or_else(|| DialError::InvalidAddress(addr.to_string()))?;
        self.dial_host(host, port).await
    }

    /// Dial `host` on `port`.
    pub async fn dial_host(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.connect(SocketAddr::new(ip, port)).await;
        }

        let addrs = self.resolver.lookup_host(host).await?;
        let mut last_err = None;
        for ip in addrs {
            match self.connect(SocketAddr::new(ip, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(host, %ip, error = %e, "Dial attempt failed");
                    last_err = Some(e);
                }
            }
        }

        // lookup_host never returns an empty list.
        Err(last_err.unwrap_or_else(|| DialError::InvalidAddress(host.to_string())))
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(DialError::Connect { addr, source }),
            Err(_) => Err(DialError::Timeout { addr }),
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some((host, port.parse().ok()?))
}
