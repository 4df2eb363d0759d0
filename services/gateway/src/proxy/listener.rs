//! TCP listener and per-connection protocol dispatch.
//!
//! Each accepted socket gets its own task, bounded by a per-listener
//! semaphore. Inside the task the connection is classified (optional PROXY
//! prefix), TLS is terminated when the listener has certificates, and the
//! negotiated protocol picks the HTTP/1.1 or HTTP/2 driver. The accept loop
//! never waits on any of this.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::http1::serve_http1;
use super::http2::serve_http2;
use super::proxy_protocol::ClassifiedStream;
use super::tls::TlsProvider;
use super::BoxedIo;
use crate::error::HandshakeError;
use crate::router::Handler;
use crate::task;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being served.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections that carried a PROXY header.
    pub proxy_headers: AtomicU64,
    /// Connections negotiated to HTTP/2.
    pub http2_sessions: AtomicU64,
    /// PROXY, TLS or HTTP/2 handshake failures.
    pub handshake_failures: AtomicU64,
    /// Connection tasks that panicked.
    pub panics: AtomicU64,
}

/// An HTTP(S) listener bound to one router.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    tls: Option<Arc<dyn TlsProvider>>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listener. `tls` turns on TLS termination for every connection.
    pub async fn bind(
        config: ListenerConfig,
        handler: Arc<dyn Handler>,
        tls: Option<Arc<dyn TlsProvider>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            tls = tls.is_some(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            handler,
            tls,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => {
                    info!(bind_addr = %local_addr, "Listener stopping");
                    return Ok(());
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            let served = task::guarded(
                                "connection",
                                listener.handle_connection(stream, peer_addr),
                            )
                            .await;

                            match served {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    if !matches!(e, HandshakeError::Io(_)) {
                                        stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                                    }
                                    debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                                }
                                Err(failure) => {
                                    stats.panics.fetch_add(1, Ordering::Relaxed);
                                    error!(peer_addr = %peer_addr, panic = %failure.message, "Connection task panicked");
                                }
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer_addr = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Serve one connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), HandshakeError> {
        let _ = stream.set_nodelay(true);

        let classified = ClassifiedStream::classify(stream, peer_addr).await?;
        let client = classified.remote_addr();
        if let Some(header) = classified.proxy_header() {
            self.stats.proxy_headers.fetch_add(1, Ordering::Relaxed);
            debug!(client = %client, version = ?header.version, "PROXY header decoded");
        }
        let io: BoxedIo = Box::new(classified);

        let handler = Arc::clone(&self.handler);
        match &self.tls {
            Some(tls) => {
                let session = tls.accept(io).await?;
                if session.is_h2() {
                    self.stats.http2_sessions.fetch_add(1, Ordering::Relaxed);
                    serve_http2(session.io, handler, client).await
                } else {
                    Ok(serve_http1(session.io, handler, client).await?)
                }
            }
            None => Ok(serve_http1(io, handler, client).await?),
        }
    }
}
