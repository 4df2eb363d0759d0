//! HTTP/1.1 server driver and response framing bridge.
//!
//! Requests are parsed with `httparse` and served sequentially on the
//! connection until the peer closes, a read fails, or either side asks for
//! `Connection: close`. Request bodies are buffered (capped at
//! [`MAX_BODY_SIZE`]) before dispatch.
//!
//! Responses go through [`ResponseWriter`], which holds the status line and
//! headers back until the first body byte, then commits once to either
//! `Content-Length` or chunked framing.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Body as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::h2io::FlushOnWrite;
use super::tunnel::{self, Hijack};
use super::{BoxedIo, ClientAddr, RequestTarget};
use crate::body::{self, Body};
use crate::router::Handler;

/// Largest request head accepted.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest request body accepted.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Buffered response bytes before a write reaches the socket.
pub const FLUSH_THRESHOLD: usize = 2048;

const MAX_HEADERS: usize = 100;

/// Why a request could not be read.
#[derive(Debug)]
enum ReadError {
    /// Peer closed between requests.
    Closed,
    /// Protocol violation; answer with this status and close.
    Reject(StatusCode, &'static str),
    Io(io::Error),
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

enum BodyFraming {
    None,
    Length(usize),
    Chunked,
}

struct RequestHead {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
}

impl RequestHead {
    fn keep_alive(&self) -> bool {
        let tokens = connection_tokens(&self.headers);
        match self.version {
            Version::HTTP_10 => tokens.iter().any(|t| t == "keep-alive"),
            _ => !tokens.iter().any(|t| t == "close"),
        }
    }

    fn framing(&self) -> Result<BodyFraming, ReadError> {
        if let Some(te) = self.headers.get(header::TRANSFER_ENCODING) {
            let chunked = te
                .to_str()
                .ok()
                .and_then(|v| v.rsplit(',').next())
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
            if !chunked {
                return Err(ReadError::Reject(
                    StatusCode::BAD_REQUEST,
                    "unsupported transfer-encoding",
                ));
            }
            return Ok(BodyFraming::Chunked);
        }

        let mut length = None;
        for value in self.headers.get_all(header::CONTENT_LENGTH) {
            let n: usize = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or(ReadError::Reject(
                    StatusCode::BAD_REQUEST,
                    "invalid content-length",
                ))?;
            if length.is_some_and(|prev| prev != n) {
                return Err(ReadError::Reject(
                    StatusCode::BAD_REQUEST,
                    "conflicting content-length",
                ));
            }
            length = Some(n);
        }

        match length {
            Some(n) if n > MAX_BODY_SIZE => Err(ReadError::Reject(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large",
            )),
            Some(0) | None => Ok(BodyFraming::None),
            Some(n) => Ok(BodyFraming::Length(n)),
        }
    }
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Serve HTTP/1.x requests on `io` until the connection ends.
pub async fn serve_http1(
    mut io: BoxedIo,
    handler: Arc<dyn Handler>,
    client: SocketAddr,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        let head = match read_head(&mut io, &mut buf).await {
            Ok(head) => head,
            Err(ReadError::Closed) => return Ok(()),
            Err(ReadError::Io(e)) => return Err(e),
            Err(ReadError::Reject(status, reason)) => {
                debug!(%status, reason, "Rejecting request");
                return write_rejection(&mut io, status, reason).await;
            }
        };

        let body = match head.framing() {
            Ok(BodyFraming::None) => Bytes::new(),
            Ok(BodyFraming::Length(n)) => match read_exact_body(&mut io, &mut buf, n).await {
                Ok(body) => body,
                Err(ReadError::Reject(status, reason)) => {
                    return write_rejection(&mut io, status, reason).await
                }
                Err(_) => return Ok(()),
            },
            Ok(BodyFraming::Chunked) => match read_chunked_body(&mut io, &mut buf).await {
                Ok(body) => body,
                Err(ReadError::Reject(status, reason)) => {
                    return write_rejection(&mut io, status, reason).await
                }
                Err(_) => return Ok(()),
            },
            Err(ReadError::Reject(status, reason)) => {
                return write_rejection(&mut io, status, reason).await
            }
            Err(_) => return Ok(()),
        };

        let uri: Uri = match head.target.parse() {
            Ok(uri) => uri,
            Err(_) => {
                return write_rejection(&mut io, StatusCode::BAD_REQUEST, "invalid request target")
                    .await
            }
        };

        let keep_alive = head.keep_alive();
        let version = head.version;
        let is_head = head.method == Method::HEAD;

        let mut request = Request::new(body::full(body));
        *request.method_mut() = head.method;
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = head.headers;
        request.extensions_mut().insert(RequestTarget(head.target));
        request.extensions_mut().insert(ClientAddr(client));

        let mut response = handler.handle(request).await;

        if let Some(upstream) = response
            .extensions_mut()
            .remove::<Hijack>()
            .and_then(|h| h.take())
        {
            let line = format!("{} 200 connection established\r\n\r\n", version_str(version));
            io.write_all(line.as_bytes()).await?;
            io.flush().await?;

            let mut upstream = upstream;
            if !buf.is_empty() {
                // Client sent tunnel bytes right behind the CONNECT head.
                upstream.write_all(&buf).await?;
                buf.clear();
            }
            tunnel::pipe_and_close(FlushOnWrite::new(io), upstream).await;
            return Ok(());
        }

        let close = !keep_alive || connection_tokens(response.headers()).iter().any(|t| t == "close");
        if close {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        let must_close = write_response(&mut io, response, version, is_head).await?;
        if close || must_close {
            let _ = io.shutdown().await;
            return Ok(());
        }
    }
}

async fn write_rejection(io: &mut BoxedIo, status: StatusCode, reason: &str) -> io::Result<()> {
    let mut response = body::text(status, reason);
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    write_response(io, response, Version::HTTP_11, false).await?;
    let _ = io.shutdown().await;
    Ok(())
}

/// Write `response` through a [`ResponseWriter`]. Returns whether the
/// framing requires closing the connection afterwards.
async fn write_response<W>(
    io: &mut W,
    response: Response<Body>,
    version: Version,
    head_request: bool,
) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let (parts, mut body) = response.into_parts();

    let mut writer = ResponseWriter::new(io, version, head_request);
    *writer.headers_mut() = parts.headers;
    writer.set_status(parts.status);
    if let Some(len) = body.size_hint().exact() {
        writer.set_known_length(len);
    }

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    writer.write(&data).await?;
                }
            }
            Err(e) => {
                warn!(error = %e, "Response body failed mid-stream");
                return Err(io::Error::other(e));
            }
        }
    }

    writer.finish().await
}

async fn read_more<R>(io: &mut R, buf: &mut BytesMut) -> Result<(), ReadError>
where
    R: AsyncRead + Unpin,
{
    if io.read_buf(buf).await? == 0 {
        return Err(ReadError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

async fn read_head<R>(io: &mut R, buf: &mut BytesMut) -> Result<RequestHead, ReadError>
where
    R: AsyncRead + Unpin,
{
    loop {
        // Tolerate stray CRLFs between pipelined requests.
        while buf.starts_with(b"\r\n") {
            buf.advance(2);
        }

        if !buf.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut headers);
            match req.parse(buf) {
                Ok(httparse::Status::Complete(len)) => {
                    let head = build_head(&req)?;
                    buf.advance(len);
                    return Ok(head);
                }
                Ok(httparse::Status::Partial) => {
                    if buf.len() >= MAX_HEAD_SIZE {
                        return Err(ReadError::Reject(
                            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                            "request head too large",
                        ));
                    }
                }
                Err(httparse::Error::TooManyHeaders) => {
                    return Err(ReadError::Reject(
                        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                        "too many headers",
                    ))
                }
                Err(_) => {
                    return Err(ReadError::Reject(
                        StatusCode::BAD_REQUEST,
                        "malformed request",
                    ))
                }
            }
        }

        let n = io.read_buf(buf).await?;
        if n == 0 {
            return Err(ReadError::Closed);
        }
    }
}

fn build_head(req: &httparse::Request<'_, '_>) -> Result<RequestHead, ReadError> {
    let bad = |reason| ReadError::Reject(StatusCode::BAD_REQUEST, reason);

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| bad("invalid method"))?;
    let target = req.path.ok_or_else(|| bad("missing request target"))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(bad("unsupported http version")),
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| bad("invalid header name"))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| bad("invalid header value"))?;
        headers.append(name, value);
    }

    Ok(RequestHead {
        method,
        target: target.to_string(),
        version,
        headers,
    })
}

async fn read_exact_body<R>(io: &mut R, buf: &mut BytesMut, len: usize) -> Result<Bytes, ReadError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < len {
        read_more(io, buf).await?;
    }
    Ok(buf.split_to(len).freeze())
}

/// Position just past the next CRLF, reading more as needed.
async fn read_line<R>(io: &mut R, buf: &mut BytesMut, limit: usize) -> Result<usize, ReadError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            return Ok(pos + 2);
        }
        if buf.len() > limit {
            return Err(ReadError::Reject(StatusCode::BAD_REQUEST, "chunk line too long"));
        }
        read_more(io, buf).await?;
    }
}

async fn read_chunked_body<R>(io: &mut R, buf: &mut BytesMut) -> Result<Bytes, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();

    loop {
        let line_len = read_line(io, buf, 1024).await?;
        let line = buf.split_to(line_len);
        let size_field = std::str::from_utf8(&line[..line_len - 2])
            .ok()
            .and_then(|l| l.split(';').next())
            .map(str::trim)
            .ok_or(ReadError::Reject(StatusCode::BAD_REQUEST, "invalid chunk size"))?;
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| ReadError::Reject(StatusCode::BAD_REQUEST, "invalid chunk size"))?;

        if size == 0 {
            // Trailer section: discard lines until the empty one.
            loop {
                let len = read_line(io, buf, MAX_HEAD_SIZE).await?;
                buf.advance(len);
                if len == 2 {
                    return Ok(body.freeze());
                }
            }
        }

        if size > MAX_BODY_SIZE - body.len() {
            return Err(ReadError::Reject(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large",
            ));
        }

        // size <= MAX_BODY_SIZE here, so the CRLF offset cannot overflow.
        let chunk_end = size + 2;
        while buf.len() < chunk_end {
            read_more(io, buf).await?;
        }
        body.put_slice(&buf[..size]);
        if &buf[size..chunk_end] != b"\r\n" {
            return Err(ReadError::Reject(StatusCode::BAD_REQUEST, "malformed chunk"));
        }
        buf.advance(chunk_end);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// 1xx/204/304 or a HEAD response: headers only.
    Bodyless,
    Length { declared: u64 },
    Chunked,
    /// HTTP/1.0 client with unknown length: body runs to connection close.
    CloseDelimited,
}

/// Response writer for one HTTP/1.x exchange.
///
/// The head is held back until the first [`write`](Self::write),
/// [`write_header`](Self::write_header) or [`finish`](Self::finish). At that
/// point the framing is chosen once: `Content-Length` when the length is
/// known and no `Transfer-Encoding` header is set, chunked otherwise.
pub struct ResponseWriter<'a, W> {
    io: &'a mut W,
    version: Version,
    head_request: bool,
    status: StatusCode,
    headers: HeaderMap,
    known_length: Option<u64>,
    framing: Option<Framing>,
    buf: BytesMut,
    written: u64,
}

impl<'a, W> ResponseWriter<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(io: &'a mut W, version: Version, head_request: bool) -> Self {
        Self {
            io,
            version,
            head_request,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            known_length: None,
            framing: None,
            buf: BytesMut::with_capacity(FLUSH_THRESHOLD * 2),
            written: 0,
        }
    }

    /// Headers still open for modification until the head is committed.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.framing.is_none() {
            self.status = status;
        }
    }

    /// Body length known ahead of time (used when no `Content-Length` header is set).
    pub fn set_known_length(&mut self, len: u64) {
        self.known_length = Some(len);
    }

    /// Commit the status line and headers now. Later calls are no-ops.
    pub fn write_header(&mut self, status: StatusCode) {
        self.set_status(status);
        self.commit(self.known_length);
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.framing.is_none() {
            self.commit(self.known_length);
        }

        match self.framing {
            Some(Framing::Bodyless) | None => return Ok(()),
            Some(Framing::Length { declared }) => {
                if self.written + data.len() as u64 > declared {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "response body exceeds content-length",
                    ));
                }
                self.buf.put_slice(data);
            }
            Some(Framing::Chunked) => {
                if data.is_empty() {
                    return Ok(());
                }
                self.buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
                self.buf.put_slice(data);
                self.buf.put_slice(b"\r\n");
            }
            Some(Framing::CloseDelimited) => self.buf.put_slice(data),
        }
        self.written += data.len() as u64;

        if self.buf.len() > FLUSH_THRESHOLD {
            self.flush_buf().await?;
        }
        Ok(())
    }

    /// Terminate the body and flush. Returns whether the connection must
    /// close because the framing cannot delimit another response.
    pub async fn finish(mut self) -> io::Result<bool> {
        if self.framing.is_none() {
            self.commit(Some(self.known_length.unwrap_or(0)));
        }

        let must_close = match self.framing {
            Some(Framing::Chunked) => {
                self.buf.put_slice(b"0\r\n\r\n");
                false
            }
            Some(Framing::Length { declared }) if self.written < declared => {
                // Short body: the peer can no longer find the next response.
                true
            }
            Some(Framing::CloseDelimited) => true,
            _ => false,
        };

        self.flush_buf().await?;
        self.io.flush().await?;
        Ok(must_close)
    }

    fn commit(&mut self, known_length: Option<u64>) {
        if self.framing.is_some() {
            return;
        }

        let status = self.status;
        let no_body_status = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let framing = if no_body_status {
            if status != StatusCode::NOT_MODIFIED {
                self.headers.remove(header::CONTENT_LENGTH);
            }
            self.headers.remove(header::TRANSFER_ENCODING);
            Framing::Bodyless
        } else if self.head_request {
            Framing::Bodyless
        } else if self.headers.contains_key(header::TRANSFER_ENCODING) {
            self.headers.remove(header::CONTENT_LENGTH);
            self.chunked_or_close()
        } else if let Some(declared) = self
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            Framing::Length { declared }
        } else if let Some(declared) = known_length {
            self.headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(declared));
            Framing::Length { declared }
        } else {
            self.chunked_or_close()
        };

        let reason = status.canonical_reason().unwrap_or("");
        self.buf.put_slice(
            format!("{} {} {}\r\n", version_str(self.version), status.as_u16(), reason).as_bytes(),
        );
        for (name, value) in &self.headers {
            self.buf.put_slice(name.as_str().as_bytes());
            self.buf.put_slice(b": ");
            self.buf.put_slice(value.as_bytes());
            self.buf.put_slice(b"\r\n");
        }
        self.buf.put_slice(b"\r\n");

        self.framing = Some(framing);
    }

    fn chunked_or_close(&mut self) -> Framing {
        if self.version == Version::HTTP_10 {
            self.headers.remove(header::TRANSFER_ENCODING);
            self.headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            Framing::CloseDelimited
        } else {
            self.headers.insert(
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            );
            Framing::Chunked
        }
    }

    async fn flush_buf(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.io.write_all(&self.buf).await?;
            self.buf.clear();
        }
        Ok(())
    }
}
