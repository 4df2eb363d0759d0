//! PROXY protocol (v1 text and v2 binary) detection on accepted connections.
//!
//! A load balancer in front of the gateway may prefix each connection with a
//! PROXY header carrying the original client address. [`ClassifiedStream`]
//! consumes that prefix before TLS or HTTP sees the connection:
//! - bytes are read only while they can still be the start of a header
//! - everything read past the header is retained and replayed to the next reader
//! - a prefix that starts like a header but does not parse aborts the connection
//!
//! Wire formats (HAProxy PROXY protocol):
//! - v1: `PROXY TCP4|TCP6|UNKNOWN <src> <dst> <sport> <dport>\r\n`, at most 107 bytes
//! - v2: 12 byte signature, version/command, family/transport, 2 byte length,
//!   addresses, then optional TLVs (skipped)

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::{HandshakeError, ProxyHeaderError};

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// PROXY protocol v1 preamble.
const PROXY_V1_PREFIX: &[u8] = b"PROXY ";

/// Longest legal v1 line, CRLF included.
const PROXY_V1_MAX_LEN: usize = 107;

/// Fixed part of a v2 header.
const PROXY_V2_HEADER_LEN: usize = 16;

/// Version 2 with LOCAL command (health checks from the balancer itself).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Version 2 with PROXY command.
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// AF_INET + STREAM.
const FAMILY_TCP4: u8 = 0x11;

/// AF_INET6 + STREAM.
const FAMILY_TCP6: u8 = 0x21;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Initial read buffer size while sniffing for a header.
const SNIFF_BUFFER: usize = 512;

/// Which protocol version carried the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

/// A decoded PROXY header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: ProxyVersion,
    /// Original client address. `None` for v1 `UNKNOWN`, v2 `LOCAL`, or
    /// families without an address we understand.
    pub source: Option<SocketAddr>,
    /// Address the client originally connected to.
    pub destination: Option<SocketAddr>,
}

impl ProxyHeader {
    /// v1 text header for `source` → `destination`.
    pub fn encode_v1(source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
        let family = if source.is_ipv4() { "TCP4" } else { "TCP6" };
        format!(
            "PROXY {family} {} {} {} {}\r\n",
            source.ip(),
            destination.ip(),
            source.port(),
            destination.port()
        )
        .into_bytes()
    }

    /// v2 binary header for `source` → `destination` (PROXY command).
    ///
    /// Mixed families are encoded as IPv6 with the IPv4 side mapped.
    pub fn encode_v2(source: SocketAddr, destination: SocketAddr) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(PROXY_V2_HEADER_LEN + IPV6_ADDR_LEN as usize);
        buf.write_all(&PROXY_V2_SIGNATURE)?;
        buf.push(VERSION_COMMAND_PROXY);

        match (source.ip(), destination.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf.push(FAMILY_TCP4);
                buf.write_all(&IPV4_ADDR_LEN.to_be_bytes())?;
                buf.write_all(&src.octets())?;
                buf.write_all(&dst.octets())?;
            }
            (src, dst) => {
                buf.push(FAMILY_TCP6);
                buf.write_all(&IPV6_ADDR_LEN.to_be_bytes())?;
                buf.write_all(&to_v6(src).octets())?;
                buf.write_all(&to_v6(dst).octets())?;
            }
        }

        buf.write_all(&source.port().to_be_bytes())?;
        buf.write_all(&destination.port().to_be_bytes())?;
        Ok(buf)
    }

    /// v2 LOCAL header (no addresses).
    pub fn encode_v2_local() -> Vec<u8> {
        let mut buf = PROXY_V2_SIGNATURE.to_vec();
        buf.extend_from_slice(&[VERSION_COMMAND_LOCAL, 0x00, 0x00, 0x00]);
        buf
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Outcome of inspecting the bytes read so far.
#[derive(Debug, PartialEq, Eq)]
pub enum Detection {
    /// Still a possible header prefix; read more.
    Incomplete,
    /// Not a PROXY header; every byte is payload.
    Absent,
    /// A complete header occupying the first `usize` bytes.
    Present(ProxyHeader, usize),
}

/// Inspect a connection prefix.
pub fn detect(buf: &[u8]) -> Result<Detection, ProxyHeaderError> {
    if buf.is_empty() {
        return Ok(Detection::Incomplete);
    }

    let n = buf.len().min(PROXY_V1_PREFIX.len());
    if buf[..n] == PROXY_V1_PREFIX[..n] {
        if buf.len() < PROXY_V1_PREFIX.len() {
            return Ok(Detection::Incomplete);
        }
        return parse_v1(buf);
    }

    let n = buf.len().min(PROXY_V2_SIGNATURE.len());
    if buf[..n] == PROXY_V2_SIGNATURE[..n] {
        if buf.len() < PROXY_V2_HEADER_LEN {
            return Ok(Detection::Incomplete);
        }
        return parse_v2(buf);
    }

    Ok(Detection::Absent)
}

fn parse_v1(buf: &[u8]) -> Result<Detection, ProxyHeaderError> {
    let window = &buf[..buf.len().min(PROXY_V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= PROXY_V1_MAX_LEN {
            return Err(ProxyHeaderError::TooLong);
        }
        return Ok(Detection::Incomplete);
    };

    let line = std::str::from_utf8(&buf[..end])
        .map_err(|_| ProxyHeaderError::MalformedV1("non-ascii header".into()))?;
    let mut fields = line.split(' ');
    fields.next(); // "PROXY"

    let family = fields
        .next()
        .ok_or_else(|| ProxyHeaderError::MalformedV1("missing family".into()))?;
    let consumed = end + 2;

    if family == "UNKNOWN" {
        return Ok(Detection::Present(
            ProxyHeader {
                version: ProxyVersion::V1,
                source: None,
                destination: None,
            },
            consumed,
        ));
    }

    let rest: Vec<&str> = fields.collect();
    if rest.len() != 4 {
        return Err(ProxyHeaderError::MalformedV1(format!(
            "expected 4 address fields, got {}",
            rest.len()
        )));
    }

    let parse_ip = |s: &str| -> Result<IpAddr, ProxyHeaderError> {
        let ip: IpAddr = s
            .parse()
            .map_err(|_| ProxyHeaderError::MalformedV1(format!("bad address {s}")))?;
        match (family, ip) {
            ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => Ok(ip),
            _ => Err(ProxyHeaderError::MalformedV1(format!(
                "address {s} does not match {family}"
            ))),
        }
    };
    let parse_port = |s: &str| -> Result<u16, ProxyHeaderError> {
        s.parse()
            .map_err(|_| ProxyHeaderError::MalformedV1(format!("bad port {s}")))
    };

    if family != "TCP4" && family != "TCP6" {
        return Err(ProxyHeaderError::MalformedV1(format!(
            "unknown family {family}"
        )));
    }

    let source = SocketAddr::new(parse_ip(rest[0])?, parse_port(rest[2])?);
    let destination = SocketAddr::new(parse_ip(rest[1])?, parse_port(rest[3])?);

    Ok(Detection::Present(
        ProxyHeader {
            version: ProxyVersion::V1,
            source: Some(source),
            destination: Some(destination),
        },
        consumed,
    ))
}

fn parse_v2(buf: &[u8]) -> Result<Detection, ProxyHeaderError> {
    let version_command = buf[12];
    let family = buf[13];
    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;

    if version_command >> 4 != 2 {
        return Err(ProxyHeaderError::MalformedV2(format!(
            "unsupported version {}",
            version_command >> 4
        )));
    }

    let total = PROXY_V2_HEADER_LEN + addr_len;
    if buf.len() < total {
        return Ok(Detection::Incomplete);
    }
    let addrs = &buf[PROXY_V2_HEADER_LEN..total];

    let (source, destination) = match version_command {
        VERSION_COMMAND_LOCAL => (None, None),
        VERSION_COMMAND_PROXY => match family {
            FAMILY_TCP4 => {
                if addr_len < IPV4_ADDR_LEN as usize {
                    return Err(ProxyHeaderError::MalformedV2(
                        "short ipv4 address block".into(),
                    ));
                }
                let src = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
                let dst = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
                let sport = u16::from_be_bytes([addrs[8], addrs[9]]);
                let dport = u16::from_be_bytes([addrs[10], addrs[11]]);
                (
                    Some(SocketAddr::new(IpAddr::V4(src), sport)),
                    Some(SocketAddr::new(IpAddr::V4(dst), dport)),
                )
            }
            FAMILY_TCP6 => {
                if addr_len < IPV6_ADDR_LEN as usize {
                    return Err(ProxyHeaderError::MalformedV2(
                        "short ipv6 address block".into(),
                    ));
                }
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&addrs[0..16]);
                dst.copy_from_slice(&addrs[16..32]);
                let sport = u16::from_be_bytes([addrs[32], addrs[33]]);
                let dport = u16::from_be_bytes([addrs[34], addrs[35]]);
                (
                    Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), sport)),
                    Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dport)),
                )
            }
            // UNSPEC, UDP and unix sockets carry nothing usable as a peer.
            _ => (None, None),
        },
        other => {
            return Err(ProxyHeaderError::MalformedV2(format!(
                "unknown command {:#x}",
                other & 0x0F
            )))
        }
    };

    Ok(Detection::Present(
        ProxyHeader {
            version: ProxyVersion::V2,
            source,
            destination,
        },
        total,
    ))
}

/// An accepted connection with any PROXY prefix consumed.
///
/// Reads drain the retained sniff buffer before touching the socket again.
#[derive(Debug)]
pub struct ClassifiedStream<S> {
    inner: S,
    buffered: BytesMut,
    header: Option<ProxyHeader>,
    peer: SocketAddr,
}

impl<S> ClassifiedStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Sniff `inner` for a PROXY header.
    pub async fn classify(mut inner: S, peer: SocketAddr) -> Result<Self, HandshakeError> {
        let mut buffered = BytesMut::with_capacity(SNIFF_BUFFER);

        loop {
            match detect(&buffered)? {
                Detection::Incomplete => {
                    let n = inner.read_buf(&mut buffered).await?;
                    if n == 0 {
                        if buffered.is_empty() {
                            // Closed before sending anything; let the protocol layer see EOF.
                            return Ok(Self {
                                inner,
                                buffered,
                                header: None,
                                peer,
                            });
                        }
                        return Err(ProxyHeaderError::Truncated.into());
                    }
                }
                Detection::Absent => {
                    return Ok(Self {
                        inner,
                        buffered,
                        header: None,
                        peer,
                    });
                }
                Detection::Present(header, consumed) => {
                    buffered.advance(consumed);
                    debug!(
                        version = ?header.version,
                        source = ?header.source,
                        "PROXY header consumed"
                    );
                    return Ok(Self {
                        inner,
                        buffered,
                        header: Some(header),
                        peer,
                    });
                }
            }
        }
    }
}

impl<S> ClassifiedStream<S> {
    /// Original client address when the header carried one, otherwise the
    /// physical peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.header
            .as_ref()
            .and_then(|h| h.source)
            .unwrap_or(self.peer)
    }

    pub fn proxy_header(&self) -> Option<&ProxyHeader> {
        self.header.as_ref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ClassifiedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered[..n]);
            this.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ClassifiedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
