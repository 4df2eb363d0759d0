//! Gateway configuration.
//!
//! Process knobs come from the environment ([`Config::from_env`]); the
//! listener, virtual host and rule layout comes from a TOML file
//! ([`FileConfig::load`]).

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::listener::DEFAULT_MAX_CONNECTIONS;
use crate::upstream::UpstreamTarget;

/// Gateway process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the TOML layout file.
    pub config_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Concurrent connection cap per listener.
    pub max_connections: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("EDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let log_level = std::env::var("EDGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let max_connections: usize = std::env::var("EDGE_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("EDGE_MAX_CONNECTIONS must be a positive integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        Ok(Self {
            config_path,
            log_level,
            max_connections,
        })
    }
}

/// Top-level TOML layout.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: Vec<ServerConfig>,

    /// Optional HTTP/2 parent proxy.
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

/// One listening endpoint and the hosts it serves.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub docroot: PathBuf,
    #[serde(default)]
    pub enable_proxy: bool,
    pub proxy_http1: Option<bool>,
    pub proxy_http2: Option<bool>,
    #[serde(default)]
    pub enable_auth: bool,
    pub realm: Option<String>,
    pub passwd_file: Option<PathBuf>,
    #[serde(default)]
    pub url_rules: Vec<RuleConfig>,
    #[serde(default)]
    pub vhost: Vec<VhostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VhostConfig {
    pub hostname: String,
    #[serde(default)]
    pub docroot: PathBuf,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub url_rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Alias,
    Uwsgi,
    Fastcgi,
    Reverse,
    Script,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Alias => "alias",
            RuleKind::Uwsgi => "uwsgi",
            RuleKind::Fastcgi => "fastcgi",
            RuleKind::Reverse => "reverse",
            RuleKind::Script => "script",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    File,
    Dir,
    Unix,
    Tcp,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub url_prefix: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub target: Option<TargetConfig>,
    /// Per-rule document root (FastCGI).
    pub docroot: Option<PathBuf>,
}

impl RuleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |detail: &str| ConfigError::Rule {
            rule: self.url_prefix.clone(),
            detail: detail.to_string(),
        };

        if self.url_prefix.is_empty() {
            return Err(invalid("url_prefix is empty"));
        }
        if self.is_regex {
            regex::Regex::new(&self.url_prefix).map_err(|e| invalid(&e.to_string()))?;
        }

        let target = self.target.as_ref();
        let kind = target.map(|t| t.kind);
        match self.kind {
            RuleKind::Alias => match kind {
                Some(TargetKind::File) | Some(TargetKind::Dir) => {}
                _ => return Err(invalid("alias target must be file or dir")),
            },
            RuleKind::Reverse => match kind {
                Some(TargetKind::Unix) | Some(TargetKind::Http) => {}
                _ => return Err(invalid("reverse target must be unix or http")),
            },
            RuleKind::Uwsgi | RuleKind::Fastcgi => match kind {
                Some(TargetKind::Unix) | Some(TargetKind::Tcp) => {}
                _ => return Err(invalid("target must be unix or tcp")),
            },
            RuleKind::Script => {}
        }

        if let Some(target) = target {
            match target.kind {
                TargetKind::Http | TargetKind::Tcp if target.host.is_empty() || target.port == 0 => {
                    return Err(invalid("target needs host and port"))
                }
                TargetKind::File | TargetKind::Dir | TargetKind::Unix if target.path.is_empty() => {
                    return Err(invalid("target needs a path"))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Parent HTTP/2 proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// `host:port`.
    pub server: String,
    /// TLS server name; defaults to the host part of `server`.
    pub name: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    30
}

impl UpstreamConfig {
    pub fn target(&self) -> Result<UpstreamTarget, ConfigError> {
        let (host, port) = edge_networking::split_host_port(&self.server).ok_or_else(|| {
            ConfigError::Invalid(format!("upstream server {} is not host:port", self.server))
        })?;
        let server_name = self
            .name
            .clone()
            .unwrap_or_else(|| host.to_string());
        Ok(UpstreamTarget {
            host: host.to_string(),
            port,
            server_name,
            insecure: self.insecure,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("listen host {} is not an IP", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// `(http1, http2)` proxy flags; `enable_proxy` sets both unless overridden.
    pub fn proxy_flags(&self) -> (bool, bool) {
        (
            self.proxy_http1.unwrap_or(self.enable_proxy),
            self.proxy_http2.unwrap_or(self.enable_proxy),
        )
    }

    /// Whether any virtual host carries a certificate.
    pub fn has_tls(&self) -> bool {
        self.vhost.iter().any(|v| v.cert.is_some() && v.key.is_some())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.enable_auth {
            if self.passwd_file.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "server {}:{} enables auth without passwd_file",
                    self.host, self.port
                )));
            }
            if self.realm.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {}:{} enables auth without realm",
                    self.host, self.port
                )));
            }
        }
        for vhost in &self.vhost {
            if vhost.hostname.is_empty() {
                return Err(ConfigError::Invalid("vhost with empty hostname".into()));
            }
            if vhost.cert.is_some() != vhost.key.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "vhost {} needs both cert and key",
                    vhost.hostname
                )));
            }
            vhost.url_rules.iter().try_for_each(RuleConfig::validate)?;
        }
        self.url_rules.iter().try_for_each(RuleConfig::validate)
    }
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::Invalid("no [[server]] entries".into()));
        }
        self.server.iter().try_for_each(ServerConfig::validate)?;
        if let Some(upstream) = &self.upstream {
            upstream.target()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[server]]
host = "0.0.0.0"
port = 8443
docroot = "/var/www/html"
enable_proxy = true
proxy_http2 = false
enable_auth = true
realm = "edge"
passwd_file = "/etc/edge/htdigest"

  [[server.url_rules]]
  url_prefix = "/api/"
  type = "reverse"
  target = { type = "http", host = "127.0.0.1", port = 8080, path = "/" }

  [[server.url_rules]]
  url_prefix = "^/php/.*\\.php$"
  is_regex = true
  type = "fastcgi"
  target = { type = "unix", path = "/run/php.sock" }

  [[server.vhost]]
  hostname = "example.com:8443"
  docroot = "/srv/example"
  cert = "/etc/edge/example.pem"
  key = "/etc/edge/example.key"

    [[server.vhost.url_rules]]
    url_prefix = "/static/"
    type = "alias"
    target = { type = "dir", path = "/srv/static" }

[upstream]
server = "parent.example.net:443"
"#;

    #[test]
    fn test_parses_layout() {
        let config = FileConfig::parse(SAMPLE, Path::new("sample.toml")).unwrap();
        let server = &config.server[0];
        assert_eq!(server.bind_addr().unwrap(), "0.0.0.0:8443".parse().unwrap());
        assert_eq!(server.proxy_flags(), (true, false));
        assert!(server.has_tls());
        assert_eq!(server.url_rules.len(), 2);
        assert_eq!(server.url_rules[1].kind, RuleKind::Fastcgi);
        assert_eq!(server.vhost[0].url_rules[0].target.as_ref().unwrap().kind, TargetKind::Dir);

        let upstream = config.upstream.unwrap();
        let target = upstream.target().unwrap();
        assert_eq!(target.host, "parent.example.net");
        assert_eq!(target.port, 443);
        assert_eq!(target.server_name, "parent.example.net");
        assert_eq!(upstream.idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_bad_rules() {
        let bad_target = r#"
[[server]]
host = "127.0.0.1"
port = 80
  [[server.url_rules]]
  url_prefix = "/x"
  type = "alias"
  target = { type = "http", host = "a", port = 1 }
"#;
        assert!(matches!(
            FileConfig::parse(bad_target, Path::new("x.toml")),
            Err(ConfigError::Rule { .. })
        ));

        let bad_regex = r#"
[[server]]
host = "127.0.0.1"
port = 80
  [[server.url_rules]]
  url_prefix = "(["
  is_regex = true
  type = "script"
"#;
        assert!(matches!(
            FileConfig::parse(bad_regex, Path::new("x.toml")),
            Err(ConfigError::Rule { .. })
        ));
    }

    #[test]
    fn test_auth_requires_password_file() {
        let content = r#"
[[server]]
host = "127.0.0.1"
port = 80
enable_auth = true
realm = "edge"
"#;
        assert!(matches!(
            FileConfig::parse(content, Path::new("x.toml")),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = FileConfig::parse("[[server]]\nport = \"x\"", Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
