//! Proxy forwarding of non-`CONNECT` requests.
//!
//! Two forwarders share one header policy:
//! - [`DirectForwarder`] dials the request's own authority through the
//!   [`Dialer`] and speaks HTTP/1.1 to it
//! - [`ParentForwarder`] carries the request over the pooled HTTP/2 session
//!   to a parent proxy
//!
//! Hop-by-hop headers are removed in both directions. `Proxy-Connection` and
//! `Proxy-Authorization` never leave the gateway.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use edge_networking::Dialer;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, StatusCode, Uri, Version};
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::body::{self, Body, BoxError};
use crate::error::{ConfigError, ForwardError};
use crate::proxy::h2io::H2Body;
use crate::proxy::http1::MAX_BODY_SIZE;
use crate::proxy::BoxedIo;
use crate::upstream::UpstreamPool;

/// Headers that describe one transport leg.
const HOP_BY_HOP: [HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    HeaderName::from_static("keep-alive"),
    header::UPGRADE,
    header::TE,
];

/// Remove hop-by-hop headers, including any header named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_str(t.trim()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Remove headers addressed to this proxy from a request about to be forwarded.
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    headers.remove("proxy-connection");
    headers.remove(header::PROXY_AUTHORIZATION);
}

/// Header cleanup applied to every forwarded response.
pub fn finalize_response_headers(status: StatusCode, headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    if status == StatusCode::NO_CONTENT {
        headers.remove(header::CONTENT_LENGTH);
    }
}

/// Forwards proxy-bound requests.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, req: Request<Body>) -> Response<Body>;
}

/// Where a proxied request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ForwardTarget {
    /// From an absolute request URI, else the `Host` header.
    pub fn from_request<B>(req: &Request<B>) -> Result<Self, ForwardError> {
        let tls = req.uri().scheme() == Some(&Scheme::HTTPS);
        let authority = match req.uri().authority() {
            Some(authority) => authority.clone(),
            None => req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| Authority::from_str(v).ok())
                .ok_or_else(|| ForwardError::InvalidTarget(req.uri().to_string()))?,
        };

        Ok(Self {
            host: authority.host().to_string(),
            port: authority
                .port_u16()
                .unwrap_or(if tls { 443 } else { 80 }),
            tls,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host without IPv6 brackets, for SNI.
    fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

/// Rewrite `parts` for an HTTP/1.1 origin: origin-form target, `Host` set,
/// hop-by-hop and proxy headers removed.
pub(crate) fn to_origin_form(parts: &mut http::request::Parts, host: &str) {
    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(path);
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);
    strip_proxy_headers(&mut parts.headers);
    if !parts.headers.contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(host) {
            parts.headers.insert(header::HOST, value);
        }
    }
}

/// One HTTP/1.1 exchange over `io`. The connection closes once the response
/// body has been read.
pub(crate) async fn http1_exchange(
    io: BoxedIo,
    req: Request<Body>,
) -> Result<Response<Body>, ForwardError> {
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Origin connection ended with error");
        }
    });

    let response = sender.send_request(req).await?;
    let (mut parts, incoming) = response.into_parts();
    finalize_response_headers(parts.status, &mut parts.headers);
    Ok(Response::from_parts(
        parts,
        incoming.map_err(BoxError::from).boxed(),
    ))
}

/// Client TLS config for `https` origins (ALPN `http/1.1`).
pub fn origin_tls_config() -> Result<Arc<ClientConfig>, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Forwards straight to the request's authority.
pub struct DirectForwarder {
    dialer: Arc<Dialer>,
    tls: TlsConnector,
}

impl DirectForwarder {
    pub fn new(dialer: Arc<Dialer>, tls: Arc<ClientConfig>) -> Self {
        Self {
            dialer,
            tls: TlsConnector::from(tls),
        }
    }

    async fn try_forward(&self, req: Request<Body>) -> Result<Response<Body>, ForwardError> {
        let target = ForwardTarget::from_request(&req)?;
        let (mut parts, body) = req.into_parts();
        let host_header = if target.port == 80 || target.port == 443 {
            target.host.clone()
        } else {
            target.addr()
        };
        to_origin_form(&mut parts, &host_header);

        let tcp = self.dialer.dial(&target.addr()).await?;
        let io: BoxedIo = if target.tls {
            let name = ServerName::try_from(target.bare_host().to_string())
                .map_err(|_| ForwardError::InvalidTarget(target.host.clone()))?;
            let tls = self
                .tls
                .connect(name, tcp)
                .await
                .map_err(|source| ForwardError::Tls {
                    host: target.host.clone(),
                    source,
                })?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        debug!(origin = %target.addr(), "Forwarding request directly");
        http1_exchange(io, Request::from_parts(parts, body)).await
    }
}

#[async_trait]
impl Forwarder for DirectForwarder {
    async fn forward(&self, req: Request<Body>) -> Response<Body> {
        match self.try_forward(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Direct forward failed");
                body::text(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        }
    }
}

/// Collect `body` into memory, failing once it grows past `limit`.
async fn buffer_body(mut body: Body, limit: usize) -> Result<Bytes, ForwardError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ForwardError::Body(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            if buf.len().saturating_add(data.len()) > limit {
                return Err(ForwardError::Body(format!(
                    "request body exceeds {limit} bytes"
                )));
            }
            buf.extend_from_slice(&data);
        }
    }
    Ok(buf.freeze())
}

/// Forwards over the pooled HTTP/2 session to a parent proxy. The request
/// body is buffered so a failed attempt can be retried once on a fresh
/// session.
pub struct ParentForwarder {
    pool: Arc<UpstreamPool>,
}

impl ParentForwarder {
    pub fn new(pool: Arc<UpstreamPool>) -> Self {
        Self { pool }
    }

    async fn try_forward(&self, req: Request<Body>) -> Result<Response<Body>, ForwardError> {
        let target = ForwardTarget::from_request(&req)?;
        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        strip_proxy_headers(&mut parts.headers);
        parts.headers.remove(header::HOST);

        let scheme = parts.uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let authority = if target.port == 80 || target.port == 443 {
            target.host.clone()
        } else {
            target.addr()
        };
        let uri = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path)
            .build()
            .map_err(|e| ForwardError::InvalidTarget(e.to_string()))?;

        let payload = buffer_body(body, MAX_BODY_SIZE).await?;
        let payload = (!payload.is_empty()).then_some(payload);

        let build = || {
            let mut head = Request::new(());
            *head.method_mut() = parts.method.clone();
            *head.uri_mut() = uri.clone();
            *head.headers_mut() = parts.headers.clone();
            head
        };

        let session = self.pool.get_connection().await?;
        let response = match session.send(build(), payload.clone()).await {
            Ok(response) => response,
            Err(e) => {
                if !self.pool.check_error(&session).await {
                    return Err(e.into());
                }
                debug!(error = %e, "Retrying on a fresh upstream session");
                let session = self.pool.get_connection().await?;
                session.send(build(), payload).await?
            }
        };

        let (mut head, recv) = response.into_parts();
        finalize_response_headers(head.status, &mut head.headers);
        Ok(Response::from_parts(head, H2Body::new(recv).boxed()))
    }
}

#[async_trait]
impl Forwarder for ParentForwarder {
    async fn forward(&self, req: Request<Body>) -> Response<Body> {
        match self.try_forward(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(upstream = %self.pool.target().addr(), error = %e, "Parent forward failed");
                body::text(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use edge_networking::{Resolver, ResolverConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_strip_hop_by_hop_removes_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_no_content_drops_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        finalize_response_headers(StatusCode::NO_CONTENT, &mut headers);
        assert!(headers.is_empty());

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        finalize_response_headers(StatusCode::OK, &mut headers);
        assert_eq!(headers[header::CONTENT_LENGTH], "3");
    }

    #[test]
    fn test_forward_target_resolution() {
        let req = Request::get("http://origin.test:8080/x").body(()).unwrap();
        assert_eq!(
            ForwardTarget::from_request(&req).unwrap(),
            ForwardTarget {
                host: "origin.test".into(),
                port: 8080,
                tls: false
            }
        );

        let req = Request::get("https://secure.test/").body(()).unwrap();
        assert_eq!(ForwardTarget::from_request(&req).unwrap().port, 443);

        let req = Request::get("/relative")
            .header(header::HOST, "[2001:db8::5]:81")
            .body(())
            .unwrap();
        assert_eq!(ForwardTarget::from_request(&req).unwrap().addr(), "[2001:db8::5]:81");

        let req = Request::get("/relative").body(()).unwrap();
        assert!(ForwardTarget::from_request(&req).is_err());
    }

    #[test]
    fn test_origin_form_rewrite() {
        let req = Request::get("http://origin.test/a?b=1")
            .version(Version::HTTP_2)
            .header("proxy-connection", "keep-alive")
            .header(header::PROXY_AUTHORIZATION, "Digest x")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();
        to_origin_form(&mut parts, "origin.test");
        assert_eq!(parts.uri, "/a?b=1");
        assert_eq!(parts.version, Version::HTTP_11);
        assert_eq!(parts.headers[header::HOST], "origin.test");
        assert!(!parts.headers.contains_key("proxy-connection"));
        assert!(!parts.headers.contains_key(header::PROXY_AUTHORIZATION));
    }

    fn forwarder() -> DirectForwarder {
        let resolver = Arc::new(Resolver::new(ResolverConfig {
            servers: vec![],
            port: 53,
            timeout: Duration::from_millis(100),
            attempts: 1,
        }));
        DirectForwarder::new(
            Arc::new(Dialer::new(resolver)),
            origin_tls_config().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_direct_forward_strips_connection_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let origin = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\nX-Origin: yes\r\n\r\nok",
            )
            .await
            .unwrap();
            String::from_utf8(seen).unwrap()
        });

        let req = Request::get(format!("http://127.0.0.1:{port}/path"))
            .header("proxy-connection", "keep-alive")
            .body(body::empty())
            .unwrap();
        let response = forwarder().forward(req).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONNECTION).is_none());
        assert_eq!(response.headers()["x-origin"], "yes");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");

        let request_head = origin.await.unwrap();
        assert!(request_head.starts_with("GET /path HTTP/1.1\r\n"));
        assert!(!request_head.to_ascii_lowercase().contains("proxy-connection"));
    }

    #[tokio::test]
    async fn test_direct_forward_failure_is_503() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let req = Request::get(format!("http://127.0.0.1:{port}/"))
            .body(body::empty())
            .unwrap();
        let response = forwarder().forward(req).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_buffer_body_enforces_limit() {
        let bytes = buffer_body(body::full("twelve bytes"), 12).await.unwrap();
        assert_eq!(&bytes[..], b"twelve bytes");

        let err = buffer_body(body::full("thirteen byte"), 12).await.unwrap_err();
        assert!(matches!(err, ForwardError::Body(_)));
    }
}
