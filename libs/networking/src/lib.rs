//! Outbound networking for the edge gateway.
//!
//! This library provides:
//! - A dual-family (AAAA + A) DNS resolver that walks configured servers in
//!   order and tolerates partial failure
//! - A resolution-aware dialer that tries candidate addresses in order
//!
//! There is no caching at either layer; every dial resolves afresh.

pub mod dialer;
pub mod error;
pub mod resolver;

pub use dialer::{split_host_port, Dialer, DEFAULT_CONNECT_TIMEOUT};
pub use error::{DialError, ResolveError};
pub use resolver::{DnsExchange, Resolver, ResolverConfig, UdpExchange};
