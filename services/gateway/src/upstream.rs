//! Pooled HTTP/2 session to an upstream (parent proxy).
//!
//! One [`UpstreamPool`] per upstream target keeps at most one live
//! multiplexed session:
//! - [`get_connection`](UpstreamPool::get_connection) returns the stored
//!   session while it can open streams, otherwise dials a new one
//! - [`check_error`](UpstreamPool::check_error) discards a session whose
//!   connection has failed, after a caller saw a request fail on it
//! - a liveness task pings the session periodically and discards it when
//!   the ping fails or times out
//!
//! Dial and handshake are attempted twice before giving up.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use http::{Method, Request, Response, StatusCode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, UpstreamError};
use crate::proxy::h2io::H2Stream;

/// Dial + handshake attempts per `get_connection`.
pub const DIAL_ATTEMPTS: u32 = 2;

/// TCP connect timeout for the upstream.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a liveness ping may take.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness checks run this long before the upstream's idle timeout.
const LIVENESS_MARGIN: Duration = Duration::from_secs(5);

/// Floor for the liveness interval.
const MIN_LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Where a pool connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    /// TLS server name (SNI and certificate verification).
    pub server_name: String,
    /// Skip certificate verification.
    pub insecure: bool,
}

impl UpstreamTarget {
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Shared state between a session handle and its connection driver.
#[derive(Default)]
struct SessionState {
    closed: AtomicBool,
    error: StdMutex<Option<String>>,
    ping: Mutex<Option<PingPong>>,
}

/// Handle to one multiplexed upstream session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    id: u64,
    send: SendRequest<Bytes>,
    state: Arc<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Transport-level error recorded when the connection ended.
    pub fn error(&self) -> Option<String> {
        self.state.error.lock().ok().and_then(|e| e.clone())
    }

    /// Whether a new stream could be opened right now.
    pub fn can_take_new_stream(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        matches!(self.send.clone().ready().now_or_never(), Some(Ok(_)))
    }

    /// Open a stream for `request`. The caller drives the returned body.
    pub async fn send(
        &self,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<Response<h2::RecvStream>, UpstreamError> {
        let mut send = self.send.clone().ready().await?;
        let end_of_stream = body.is_none();
        let (response, mut stream) = send.send_request(request, end_of_stream)?;
        if let Some(body) = body {
            stream.send_data(body, true)?;
        }
        Ok(response.await?)
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration, UpstreamError> {
        let mut guard = self.state.ping.lock().await;
        let ping_pong = guard
            .as_mut()
            .ok_or_else(|| UpstreamError::Body("ping handle unavailable".into()))?;

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, ping_pong.ping(Ping::opaque())).await {
            Ok(Ok(_pong)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(UpstreamError::Stream(e)),
            Err(_) => Err(UpstreamError::PingTimeout(timeout)),
        }
    }
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    last_error: Option<String>,
}

/// One pooled HTTP/2 session per upstream target.
pub struct UpstreamPool {
    target: UpstreamTarget,
    tls: Arc<ClientConfig>,
    idle_timeout: Duration,
    ping_timeout: Duration,
    slot: Mutex<Slot>,
    dials: AtomicU64,
    next_id: AtomicU64,
}

impl fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamPool")
            .field("target", &self.target)
            .field("idle_timeout", &self.idle_timeout)
            .field("dials", &self.dial_count())
            .finish_non_exhaustive()
    }
}

impl UpstreamPool {
    /// Pool with a TLS config derived from the target's verification mode.
    pub fn new(target: UpstreamTarget, idle_timeout: Duration) -> Result<Self, ConfigError> {
        let tls = client_tls_config(target.insecure)?;
        Ok(Self::with_tls_config(target, tls, idle_timeout))
    }

    pub fn with_tls_config(
        target: UpstreamTarget,
        tls: Arc<ClientConfig>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            target,
            tls,
            idle_timeout,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            slot: Mutex::new(Slot::default()),
            dials: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Dial attempts made so far.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// `max(idle_timeout - 5s, 1s)`.
    pub fn liveness_interval(&self) -> Duration {
        self.idle_timeout
            .saturating_sub(LIVENESS_MARGIN)
            .max(MIN_LIVENESS_INTERVAL)
    }

    /// Stored session if usable, otherwise a freshly dialed one.
    pub async fn get_connection(&self) -> Result<Session, UpstreamError> {
        let mut slot = self.slot.lock().await;

        if let Some(session) = &slot.session {
            if session.can_take_new_stream() {
                return Ok(session.clone());
            }
            debug!(session = session.id, "Stored upstream session unusable, redialing");
        }
        slot.session = None;

        let mut last = String::new();
        for attempt in 1..=DIAL_ATTEMPTS {
            match self.dial().await {
                Ok(session) => {
                    info!(
                        upstream = %self.target.addr(),
                        session = session.id,
                        attempt,
                        "Upstream session established"
                    );
                    slot.session = Some(session.clone());
                    slot.last_error = None;
                    return Ok(session);
                }
                Err(e) => {
                    warn!(upstream = %self.target.addr(), attempt, error = %e, "Upstream dial failed");
                    last = e.to_string();
                    slot.last_error = Some(last.clone());
                }
            }
        }

        Err(UpstreamError::Exhausted {
            attempts: DIAL_ATTEMPTS,
            last,
        })
    }

    /// After a failed use of `session`: discard it if its connection reports
    /// a transport error (or has closed) so the next call redials.
    pub async fn check_error(&self, session: &Session) -> bool {
        if let Some(error) = session.error() {
            debug!(session = session.id, error = %error, "Discarding failed upstream session");
            self.invalidate(session.id).await;
            return true;
        }
        if session.is_closed() {
            self.invalidate(session.id).await;
            return true;
        }
        false
    }

    /// Drop the stored session if it is still `id`.
    pub async fn invalidate(&self, id: u64) {
        let mut slot = self.slot.lock().await;
        if slot.session.as_ref().is_some_and(|s| s.id == id) {
            slot.session = None;
        }
    }

    /// Last dial or session error, for diagnostics.
    pub async fn last_error(&self) -> Option<String> {
        self.slot.lock().await.last_error.clone()
    }

    /// Ping the stored session; discard it on failure. Returns whether the
    /// session (if any) is healthy.
    pub async fn check_liveness(&self) -> bool {
        let session = self.slot.lock().await.session.clone();
        let Some(session) = session else {
            return true;
        };

        match session.ping(self.ping_timeout).await {
            Ok(rtt) => {
                debug!(session = session.id, rtt_ms = rtt.as_millis() as u64, "Upstream ping ok");
                true
            }
            Err(e) => {
                warn!(session = session.id, error = %e, "Upstream ping failed, discarding session");
                {
                    let mut slot = self.slot.lock().await;
                    slot.last_error = Some(format!("liveness ping failed: {e}"));
                }
                self.invalidate(session.id).await;
                false
            }
        }
    }

    /// Run [`check_liveness`](Self::check_liveness) every
    /// [`liveness_interval`](Self::liveness_interval) until shutdown.
    pub fn spawn_liveness(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.liveness_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_liveness().await;
                    }
                    _ = shutdown.changed() => {
                        debug!(upstream = %self.target.addr(), "Liveness task stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Open a `CONNECT` stream to `authority` through the upstream.
    pub async fn connect_tunnel(&self, authority: &str) -> Result<H2Stream, UpstreamError> {
        let session = self.get_connection().await?;

        let request = Request::builder()
            .method(Method::CONNECT)
            .uri(authority)
            .body(())
            .map_err(|e| UpstreamError::Body(e.to_string()))?;

        let opened = async {
            let mut send = session.send.clone().ready().await?;
            let (response, stream) = send.send_request(request, false)?;
            let response = response.await?;
            Ok::<_, UpstreamError>((response, stream))
        }
        .await;

        let (response, stream) = match opened {
            Ok(v) => v,
            Err(e) => {
                self.check_error(&session).await;
                return Err(e);
            }
        };

        if response.status() != StatusCode::OK {
            return Err(UpstreamError::Refused(response.status()));
        }
        Ok(H2Stream::new(stream, response.into_body()))
    }

    async fn dial(&self) -> Result<Session, UpstreamError> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        let addr = self.target.addr();

        let tcp = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => return Err(UpstreamError::Connect { addr, source }),
            Err(_) => return Err(UpstreamError::ConnectTimeout { addr }),
        };
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(self.target.server_name.clone())
            .map_err(|_| UpstreamError::ServerName(self.target.server_name.clone()))?;
        let tls = TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, tcp)
            .await
            .map_err(UpstreamError::Tls)?;
        if tls.get_ref().1.alpn_protocol() != Some(b"h2") {
            return Err(UpstreamError::NoH2);
        }

        let (send, mut connection) = h2::client::handshake(tls)
            .await
            .map_err(UpstreamError::Handshake)?;

        let state = Arc::new(SessionState {
            ping: Mutex::new(connection.ping_pong()),
            ..SessionState::default()
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let driver_state = Arc::clone(&state);
        tokio::spawn(async move {
            let result = connection.await;
            if let Err(e) = result {
                debug!(session = id, error = %e, "Upstream connection ended with error");
                if let Ok(mut slot) = driver_state.error.lock() {
                    *slot = Some(e.to_string());
                }
            }
            driver_state.closed.store(true, Ordering::Release);
        });

        Ok(Session { id, send, state })
    }
}

/// Client TLS config for upstream sessions (ALPN `h2`).
pub fn client_tls_config(insecure: bool) -> Result<Arc<ClientConfig>, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(config))
}

/// Accepts any server certificate. Signatures are still checked so the
/// handshake itself stays sound.
#[derive(Debug)]
struct NoVerify(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
