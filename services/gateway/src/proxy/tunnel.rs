//! `CONNECT` tunnels.
//!
//! [`TunnelManager::open`] dials the requested target and answers with a
//! response carrying a [`Hijack`] extension that holds the upstream stream.
//! The protocol driver that sent the request takes it out, completes the
//! handshake on its side (a literal status line on HTTP/1.1, a `200`
//! HEADERS frame on HTTP/2) and hands both ends to [`pipe_and_close`].
//!
//! A tunnel moves through `Open -> Piping -> Closed`. The first copy
//! direction to finish tears the whole tunnel down.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use edge_networking::Dialer;
use http::{Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BoxedIo, RequestTarget};
use crate::body::{self, Body};
use crate::error::{TaskFailure, TunnelError};
use crate::task;
use crate::upstream::UpstreamPool;

/// Port assumed when a `CONNECT` target has none.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Upstream stream for an established tunnel, handed from the router to the
/// protocol driver through response extensions.
#[derive(Clone)]
pub struct Hijack(Arc<Mutex<Option<BoxedIo>>>);

impl Hijack {
    pub fn new(upstream: BoxedIo) -> Self {
        Self(Arc::new(Mutex::new(Some(upstream))))
    }

    /// Take the upstream stream. Only the first call gets it.
    pub fn take(&self) -> Option<BoxedIo> {
        self.0.lock().ok()?.take()
    }
}

impl fmt::Debug for Hijack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hijack").finish_non_exhaustive()
    }
}

/// Tunnel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Open,
    Piping,
    Closed,
}

/// Copy direction within a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn task_name(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "tunnel-client-to-upstream",
            Direction::UpstreamToClient => "tunnel-upstream-to-client",
        }
    }
}

/// How one copy task ended.
#[derive(Debug)]
pub enum CopyOutcome {
    /// Source reached EOF after this many bytes.
    Finished(u64),
    Failed(TunnelError),
    Panicked(TaskFailure),
}

/// Report sent by a copy task when it stops.
#[derive(Debug)]
pub struct CopyReport {
    pub direction: Direction,
    pub outcome: CopyOutcome,
}

/// Summary of a finished tunnel.
#[derive(Debug)]
pub struct TunnelSummary {
    /// The direction whose completion triggered teardown.
    pub first: Option<CopyReport>,
    pub state: TunnelState,
}

/// Pipe bytes between `client` and `upstream` until either direction ends,
/// then close both.
pub async fn pipe_and_close<C, U>(client: C, upstream: U) -> TunnelSummary
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut state = TunnelState::Open;
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let (tx, mut rx) = mpsc::channel::<CopyReport>(2);
    let outbound = spawn_copy(
        Direction::ClientToUpstream,
        client_read,
        upstream_write,
        tx.clone(),
    );
    let inbound = spawn_copy(Direction::UpstreamToClient, upstream_read, client_write, tx);
    state = advance(state, TunnelState::Piping);

    let first = rx.recv().await;

    // Dropping the aborted task's halves closes both transports.
    outbound.abort();
    inbound.abort();
    let _ = outbound.await;
    let _ = inbound.await;
    state = advance(state, TunnelState::Closed);

    match &first {
        Some(CopyReport {
            direction,
            outcome: CopyOutcome::Finished(bytes),
        }) => debug!(?direction, bytes, "Tunnel closed"),
        Some(CopyReport {
            direction,
            outcome: CopyOutcome::Failed(e),
        }) => debug!(?direction, error = %e, "Tunnel closed on error"),
        Some(CopyReport {
            direction,
            outcome: CopyOutcome::Panicked(failure),
        }) => warn!(?direction, panic = %failure.message, "Tunnel copy task panicked"),
        None => debug!("Tunnel closed without report"),
    }

    TunnelSummary { first, state }
}

fn advance(from: TunnelState, to: TunnelState) -> TunnelState {
    debug!(?from, ?to, "Tunnel state change");
    to
}

fn spawn_copy<R, W>(
    direction: Direction,
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    tx: mpsc::Sender<CopyReport>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        let copied = task::guarded(direction.task_name(), async {
            let n = tokio::io::copy(&mut reader, &mut writer).await?;
            let _ = writer.shutdown().await;
            Ok::<u64, io::Error>(n)
        })
        .await;

        let outcome = match copied {
            Ok(Ok(n)) => CopyOutcome::Finished(n),
            Ok(Err(e)) => CopyOutcome::Failed(TunnelError::Io(e)),
            Err(failure) => CopyOutcome::Panicked(failure),
        };
        let _ = tx.send(CopyReport { direction, outcome }).await;
    })
}

/// Target of a `CONNECT` request as `host:port`.
///
/// HTTP/1.x uses the raw request-target, HTTP/2 the `:authority`.
pub fn tunnel_target<B>(req: &Request<B>) -> Result<String, TunnelError> {
    let raw = req
        .extensions()
        .get::<RequestTarget>()
        .map(|t| t.0.clone())
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let raw = raw.trim();
    if raw.is_empty() || raw.contains('/') {
        return Err(TunnelError::InvalidTarget(raw.to_string()));
    }

    let has_port = if raw.starts_with('[') {
        raw.contains("]:")
    } else {
        raw.contains(':')
    };

    if has_port {
        Ok(raw.to_string())
    } else {
        Ok(format!("{raw}:{DEFAULT_TUNNEL_PORT}"))
    }
}

/// Opens `CONNECT` tunnels, directly through the dialer or over the parent
/// HTTP/2 session when one is configured.
pub struct TunnelManager {
    dialer: Arc<Dialer>,
    parent: Option<Arc<UpstreamPool>>,
}

impl TunnelManager {
    pub fn new(dialer: Arc<Dialer>, parent: Option<Arc<UpstreamPool>>) -> Self {
        Self { dialer, parent }
    }

    /// Dial the request's target. Success yields an empty `200` response
    /// carrying [`Hijack`]; failure a `503` with the reason.
    pub async fn open(&self, req: &Request<Body>) -> Response<Body> {
        let target = match tunnel_target(req) {
            Ok(target) => target,
            Err(e) => return body::text(StatusCode::BAD_REQUEST, e.to_string()),
        };

        match self.dial(&target).await {
            Ok(upstream) => {
                info!(tunnel = %target, "Tunnel established");
                let mut response = Response::new(body::empty());
                response.extensions_mut().insert(Hijack::new(upstream));
                response
            }
            Err(e) => {
                warn!(tunnel = %target, error = %e, "Tunnel dial failed");
                body::text(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("dial to {target} failed: {e}"),
                )
            }
        }
    }

    async fn dial(&self, target: &str) -> Result<BoxedIo, TunnelError> {
        match &self.parent {
            Some(pool) => Ok(Box::new(pool.connect_tunnel(target).await?)),
            None => Ok(Box::new(self.dialer.dial(target).await?)),
        }
    }
}
