//! Dual-family DNS resolution.
//!
//! `lookup_host` issues independent AAAA and A queries. Each query walks the
//! configured servers in order and stops at the first server that produces a
//! parseable reply; an empty answer section still counts as an answer. The
//! lookup only fails when both query types failed against every server.
//!
//! Results are ordered IPv6 first, then IPv4.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::ResolveError;

/// Default DNS port.
pub const DNS_PORT: u16 = 53;

/// Largest UDP reply we accept.
const MAX_UDP_REPLY: usize = 4096;

/// Resolver configuration: which servers to ask and how patiently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Servers in the order they are tried.
    pub servers: Vec<IpAddr>,

    /// Port queried on every server.
    pub port: u16,

    /// Per-attempt reply timeout.
    pub timeout: Duration,

    /// Attempts per server before moving to the next one.
    pub attempts: u32,
}

impl ResolverConfig {
    /// Public fallback servers used when no system configuration is usable.
    pub fn fallback() -> Self {
        Self {
            servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(4, 2, 2, 2)),
            ],
            port: DNS_PORT,
            timeout: Duration::from_secs(2),
            attempts: 3,
        }
    }

    /// Parse `resolv.conf` content.
    ///
    /// Honors `nameserver` lines (IPv6 zone suffixes are dropped) and the
    /// `timeout:` / `attempts:` options. Returns `None` when no usable
    /// nameserver is listed.
    pub fn parse(content: &str) -> Option<Self> {
        let mut config = Self {
            servers: Vec::new(),
            ..Self::fallback()
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    let Some(raw) = fields.next() else { continue };
                    let raw = raw.split('%').next().unwrap_or(raw);
                    match raw.parse::<IpAddr>() {
                        Ok(ip) => config.servers.push(ip),
                        Err(_) => debug!(nameserver = raw, "Ignoring unparseable nameserver"),
                    }
                }
                Some("options") => {
                    for opt in fields {
                        if let Some(v) = opt.strip_prefix("timeout:") {
                            if let Ok(secs) = v.parse::<u64>() {
                                config.timeout = Duration::from_secs(secs.max(1));
                            }
                        } else if let Some(v) = opt.strip_prefix("attempts:") {
                            if let Ok(n) = v.parse::<u32>() {
                                config.attempts = n.max(1);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if config.servers.is_empty() {
            None
        } else {
            Some(config)
        }
    }

    /// Read and parse a `resolv.conf` file.
    pub fn from_resolv_conf(path: impl AsRef<Path>) -> Result<Option<Self>, ResolveError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// The system configuration, or the public fallback when `/etc/resolv.conf`
    /// is missing or lists no servers.
    pub fn system() -> Self {
        match Self::from_resolv_conf("/etc/resolv.conf") {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("resolv.conf lists no nameservers, using fallback servers");
                Self::fallback()
            }
            Err(e) => {
                warn!(error = %e, "Failed to read resolv.conf, using fallback servers");
                Self::fallback()
            }
        }
    }
}

/// One request/response exchange with a DNS server.
#[async_trait]
pub trait DnsExchange: Send + Sync {
    /// Send `query` to `server` and return the matching reply.
    async fn exchange(&self, query: &Message, server: SocketAddr) -> Result<Message, ResolveError>;
}

/// Plain DNS over UDP.
#[derive(Debug, Clone)]
pub struct UdpExchange {
    timeout: Duration,
    attempts: u32,
}

impl UdpExchange {
    pub fn new(timeout: Duration, attempts: u32) -> Self {
        Self {
            timeout,
            attempts: attempts.max(1),
        }
    }

    async fn attempt(&self, wire: &[u8], id: u16, server: SocketAddr) -> Result<Message, ResolveError> {
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        socket.send(wire).await?;

        let mut buf = vec![0u8; MAX_UDP_REPLY];
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let n = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| ResolveError::Timeout {
                    server: server.to_string(),
                })??;

            let reply = match Message::from_vec(&buf[..n]) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(%server, error = %e, "Discarding undecodable dns reply");
                    continue;
                }
            };
            if reply.id() != id || reply.message_type() != MessageType::Response {
                debug!(%server, "Discarding mismatched dns reply");
                continue;
            }
            return Ok(reply);
        }
    }
}

#[async_trait]
impl DnsExchange for UdpExchange {
    async fn exchange(&self, query: &Message, server: SocketAddr) -> Result<Message, ResolveError> {
        let wire = query.to_vec()?;
        let mut last_err = None;
        for _ in 0..self.attempts {
            match self.attempt(&wire, query.id(), server).await {
                Ok(reply) => return Ok(reply),
                Err(e @ ResolveError::Timeout { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ResolveError::Timeout {
            server: server.to_string(),
        }))
    }
}

/// Dual-family resolver over an ordered server list.
#[derive(Clone)]
pub struct Resolver {
    config: ResolverConfig,
    exchange: Arc<dyn DnsExchange>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Resolver speaking UDP to the configured servers.
    pub fn new(config: ResolverConfig) -> Self {
        let exchange = Arc::new(UdpExchange::new(config.timeout, config.attempts));
        Self { config, exchange }
    }

    /// Resolver with a custom transport.
    pub fn with_exchange(config: ResolverConfig, exchange: Arc<dyn DnsExchange>) -> Self {
        Self { config, exchange }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve `host` to its addresses, IPv6 first.
    pub async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if self.config.servers.is_empty() {
            return Err(ResolveError::NoServers);
        }

        let name = Name::from_ascii(format!("{}.", host.trim_end_matches('.'))).map_err(|e| {
            ResolveError::InvalidName {
                host: host.to_string(),
                detail: e.to_string(),
            }
        })?;

        let (v6, v4) = tokio::join!(
            self.query(&name, RecordType::AAAA),
            self.query(&name, RecordType::A)
        );

        let mut addrs = Vec::new();
        let mut last_err = None;
        for result in [v6, v4] {
            match result {
                Ok(found) => addrs.extend(found),
                Err(e) => last_err = Some(e),
            }
        }

        if addrs.is_empty() {
            return Err(last_err.unwrap_or(ResolveError::NoRecords {
                host: host.to_string(),
            }));
        }

        debug!(host, count = addrs.len(), "Resolved host");
        Ok(addrs)
    }

    /// One record type against each server in order.
    async fn query(&self, name: &Name, rtype: RecordType) -> Result<Vec<IpAddr>, ResolveError> {
        let mut message = Message::new();
        message
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name.clone(), rtype));

        let mut last_err = ResolveError::NoServers;
        for ip in &self.config.servers {
            let server = SocketAddr::new(*ip, self.config.port);
            match self.exchange.exchange(&message, server).await {
                Ok(reply) => return Ok(extract_addrs(&reply, rtype)),
                Err(e) => {
                    debug!(%server, ?rtype, error = %e, "DNS server failed, trying next");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

fn extract_addrs(reply: &Message, rtype: RecordType) -> Vec<IpAddr> {
    reply
        .answers()
        .iter()
        .filter_map(|record| match (rtype, record.data()?) {
            (RecordType::AAAA, RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            (RecordType::A, RData::A(a)) => Some(IpAddr::V4(a.0)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;
    use std::collections::HashMap;
    use std::net::Ipv6Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Outcome {
        Answer(Vec<IpAddr>),
        Rcode(ResponseCode),
        Fail,
    }

    /// Scripted exchange keyed by (server, record type).
    #[derive(Default)]
    struct ScriptedExchange {
        script: Mutex<HashMap<(IpAddr, RecordType), Outcome>>,
        calls: AtomicUsize,
    }

    impl ScriptedExchange {
        fn set(&self, server: IpAddr, rtype: RecordType, outcome: Outcome) {
            self.script.lock().unwrap().insert((server, rtype), outcome);
        }
    }

    #[async_trait]
    impl DnsExchange for ScriptedExchange {
        async fn exchange(&self, query: &Message, server: SocketAddr) -> Result<Message, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let q = &query.queries()[0];
            let outcome = self
                .script
                .lock()
                .unwrap()
                .get(&(server.ip(), q.query_type()))
                .cloned()
                .unwrap_or(Outcome::Fail);

            let mut reply = Message::new();
            reply
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .add_query(q.clone());

            match outcome {
                Outcome::Fail => Err(ResolveError::Timeout {
                    server: server.to_string(),
                }),
                Outcome::Rcode(code) => {
                    reply.set_response_code(code);
                    Ok(reply)
                }
                Outcome::Answer(ips) => {
                    for ip in ips {
                        let rdata = match ip {
                            IpAddr::V4(v4) => RData::A(A(v4)),
                            IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
                        };
                        reply.add_answer(Record::from_rdata(q.name().clone(), 60, rdata));
                    }
                    Ok(reply)
                }
            }
        }
    }

    const S1: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const S2: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn resolver(exchange: Arc<ScriptedExchange>) -> Resolver {
        let config = ResolverConfig {
            servers: vec![S1, S2],
            ..ResolverConfig::fallback()
        };
        Resolver::with_exchange(config, exchange)
    }

    fn v4(a: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, a))
    }

    fn v6(a: u16) -> IpAddr {
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, a))
    }

    #[tokio::test]
    async fn test_ipv6_results_come_first() {
        let ex = Arc::new(ScriptedExchange::default());
        ex.set(S1, RecordType::A, Outcome::Answer(vec![v4(1), v4(2)]));
        ex.set(S1, RecordType::AAAA, Outcome::Answer(vec![v6(1)]));

        let addrs = resolver(ex).lookup_host("example.com").await.unwrap();
        assert_eq!(addrs, vec![v6(1), v4(1), v4(2)]);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_server_per_type() {
        let ex = Arc::new(ScriptedExchange::default());
        ex.set(S1, RecordType::AAAA, Outcome::Answer(vec![v6(7)]));
        ex.set(S2, RecordType::A, Outcome::Answer(vec![v4(9)]));

        let addrs = resolver(ex).lookup_host("example.com").await.unwrap();
        assert_eq!(addrs, vec![v6(7), v4(9)]);
    }

    #[tokio::test]
    async fn test_partial_results_when_one_type_fails_everywhere() {
        let ex = Arc::new(ScriptedExchange::default());
        ex.set(S2, RecordType::A, Outcome::Answer(vec![v4(3)]));

        let addrs = resolver(ex).lookup_host("v4only.test").await.unwrap();
        assert_eq!(addrs, vec![v4(3)]);
    }

    #[tokio::test]
    async fn test_error_when_every_server_fails_both_types() {
        let ex = Arc::new(ScriptedExchange::default());
        let err = resolver(ex.clone()).lookup_host("down.test").await.unwrap_err();
        assert!(matches!(err, ResolveError::Timeout { .. }));
        // Two servers, two record types.
        assert_eq!(ex.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_empty_answer_stops_server_walk() {
        let ex = Arc::new(ScriptedExchange::default());
        ex.set(S1, RecordType::AAAA, Outcome::Rcode(ResponseCode::NXDomain));
        ex.set(S1, RecordType::A, Outcome::Answer(vec![]));
        ex.set(S2, RecordType::A, Outcome::Answer(vec![v4(5)]));

        let err = resolver(ex.clone()).lookup_host("missing.test").await.unwrap_err();
        assert!(matches!(err, ResolveError::NoRecords { .. }));
        assert_eq!(ex.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_servers() {
        let config = ResolverConfig {
            servers: vec![],
            ..ResolverConfig::fallback()
        };
        let r = Resolver::with_exchange(config, Arc::new(ScriptedExchange::default()));
        assert!(matches!(
            r.lookup_host("example.com").await,
            Err(ResolveError::NoServers)
        ));
    }

    #[test]
    fn test_parse_resolv_conf() {
        let content = "\
# generated
nameserver 192.0.2.53
nameserver fe80::1%eth0
nameserver not-an-ip
search example.internal
options timeout:5 attempts:2 rotate
";
        let config = ResolverConfig::parse(content).unwrap();
        assert_eq!(
            config.servers,
            vec![
                "192.0.2.53".parse::<IpAddr>().unwrap(),
                "fe80::1".parse::<IpAddr>().unwrap()
            ]
        );
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.attempts, 2);
        assert_eq!(config.port, DNS_PORT);
    }

    #[test]
    fn test_parse_resolv_conf_without_servers() {
        assert!(ResolverConfig::parse("search example.internal\n").is_none());
    }

    #[test]
    fn test_fallback_servers() {
        let config = ResolverConfig::fallback();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.attempts, 3);
    }
}
