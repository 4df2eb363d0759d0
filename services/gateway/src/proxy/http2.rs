//! HTTP/2 server driver.
//!
//! Each accepted stream runs as its own guarded task. A `CONNECT` stream
//! whose response carries a [`Hijack`] becomes a tunnel: the `200` HEADERS
//! frame is sent without end-of-stream and the stream's DATA frames are
//! piped to the upstream.

use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use hyper::body::Body as _;
use tracing::{debug, warn};

use super::h2io::{FlushOnWrite, H2Body, H2Stream};
use super::tunnel::{self, Hijack};
use super::{BoxedIo, ClientAddr};
use crate::body::{self, Body, BoxError};
use crate::error::HandshakeError;
use crate::forward;
use crate::router::Handler;
use crate::task;

/// Serve HTTP/2 streams on `io` until the connection ends.
pub async fn serve_http2(
    io: BoxedIo,
    handler: Arc<dyn Handler>,
    client: SocketAddr,
) -> Result<(), HandshakeError> {
    let mut conn = h2::server::handshake(io)
        .await
        .map_err(HandshakeError::Http2)?;

    while let Some(accepted) = conn.accept().await {
        match accepted {
            Ok((request, respond)) => {
                let handler = Arc::clone(&handler);
                task::spawn_guarded("h2-stream", serve_stream(request, respond, handler, client));
            }
            Err(e) => {
                debug!(error = %e, "HTTP/2 connection ended");
                return Ok(());
            }
        }
    }

    // Peer sent GOAWAY: keep driving I/O so in-flight streams finish.
    if let Err(e) = poll_fn(|cx| conn.poll_closed(cx)).await {
        debug!(error = %e, "HTTP/2 connection closed with error");
    }
    Ok(())
}

async fn serve_stream(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    handler: Arc<dyn Handler>,
    client: SocketAddr,
) {
    let (mut parts, recv) = request.into_parts();
    parts.extensions.insert(ClientAddr(client));
    let is_head = parts.method == Method::HEAD;

    // A CONNECT stream's DATA frames are tunnel bytes, not a request body.
    let (body, tunnel_recv) = if parts.method == Method::CONNECT {
        (body::empty(), Some(recv))
    } else {
        (H2Body::new(recv).boxed(), None)
    };

    let mut response = handler.handle(Request::from_parts(parts, body)).await;

    if let Some(recv) = tunnel_recv {
        if let Some(upstream) = response
            .extensions_mut()
            .remove::<Hijack>()
            .and_then(|h| h.take())
        {
            let send = match respond.send_response(Response::new(()), false) {
                Ok(send) => send,
                Err(e) => {
                    debug!(error = %e, "Client went away before tunnel start");
                    return;
                }
            };
            tunnel::pipe_and_close(FlushOnWrite::new(H2Stream::new(send, recv)), upstream).await;
            return;
        }
    }

    let (mut head, body) = response.into_parts();
    forward::strip_hop_by_hop(&mut head.headers);
    let end_of_stream = is_head || body.is_end_stream();

    let mut send = match respond.send_response(Response::from_parts(head, ()), end_of_stream) {
        Ok(send) => send,
        Err(e) => {
            debug!(error = %e, "Failed to send response headers");
            return;
        }
    };
    if end_of_stream {
        return;
    }

    if let Err(e) = send_body(&mut send, body).await {
        warn!(error = %e, "Response body failed mid-stream");
        send.send_reset(Reason::INTERNAL_ERROR);
    }
}

/// Stream `body` as DATA frames within the peer's flow-control window,
/// ending with trailers or an empty end-of-stream frame.
async fn send_body(send: &mut SendStream<Bytes>, mut body: Body) -> Result<(), BoxError> {
    while let Some(frame) = body.frame().await {
        match frame?.into_data() {
            Ok(mut data) => {
                while !data.is_empty() {
                    send.reserve_capacity(data.len());
                    let capacity = poll_fn(|cx| send.poll_capacity(cx))
                        .await
                        .ok_or("stream closed by peer")??;
                    if capacity == 0 {
                        continue;
                    }
                    let chunk = data.split_to(capacity.min(data.len()));
                    send.send_data(chunk, false)?;
                }
            }
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    send.send_trailers(trailers)?;
                    return Ok(());
                }
            }
        }
    }
    send.send_data(Bytes::new(), true)?;
    Ok(())
}
