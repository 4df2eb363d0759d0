//! Request classification and rule-based dispatch.
//!
//! Every request is first classified as local or proxy-bound:
//! - HTTP/1.x: a request-target starting with `/` is local
//! - HTTP/2: local unless HTTP/2 proxying is on and the authority matches
//!   none of the listener's local domains
//! - `CONNECT` is always proxy-bound
//!
//! Local requests pick a virtual host by `Host`/authority (else the default
//! host) and run the first matching [`UrlRule`] in registration order, falling
//! through to static files. Proxy-bound requests pass the per-version proxy
//! flag and digest authentication, then go to the tunnel manager or the
//! forwarder.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use edge_networking::Dialer;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode, Version};
use regex::Regex;
use tracing::{debug, warn};

use crate::auth::DigestAuth;
use crate::body::{self, Body};
use crate::config::{RuleConfig, RuleKind, ServerConfig, TargetKind};
use crate::error::ConfigError;
use crate::forward::Forwarder;
use crate::handlers::{AliasDir, AliasFile, ReverseProxy, ReverseTarget, StaticFiles};
use crate::proxy::{RequestTarget, TunnelManager};

/// Serves one request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request<Body>) -> Response<Body>;
}

/// Builds handlers for rule kinds the gateway does not implement itself
/// (`uwsgi`, `fastcgi`, `script`).
pub trait HandlerProvider: Send + Sync {
    /// `docroot` is the rule's own document root, else its host's.
    fn build(
        &self,
        rule: &RuleConfig,
        docroot: &std::path::Path,
    ) -> Result<Arc<dyn Handler>, ConfigError>;
}

/// Path prefix consumed by the matching rule, for handlers that strip it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPrefix(pub String);

/// How a rule matches a request path.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    Prefix(String),
    Exact(String),
    /// Matches anywhere in the path.
    Regex(Regex),
}

impl RuleMatcher {
    /// Strippable prefix when the rule matches `path`.
    pub fn matches(&self, path: &str) -> Option<String> {
        match self {
            RuleMatcher::Prefix(prefix) => path
                .starts_with(prefix.as_str())
                .then(|| prefix.trim_end_matches('/').to_string()),
            RuleMatcher::Exact(exact) => (path == exact).then(String::new),
            RuleMatcher::Regex(re) => re.find(path).map(|m| {
                if m.start() == 0 {
                    m.as_str().trim_end_matches('/').to_string()
                } else {
                    String::new()
                }
            }),
        }
    }
}

/// A matcher bound to the handler it dispatches to.
#[derive(Clone)]
pub struct UrlRule {
    pub matcher: RuleMatcher,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for UrlRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlRule")
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Rules and fallback for one host.
pub struct VirtualHostRoutes {
    /// Normalized hostname, port stripped. Empty for the default host.
    pub hostname: String,
    pub rules: Vec<UrlRule>,
    pub fallback: Arc<dyn Handler>,
}

impl VirtualHostRoutes {
    pub fn new(hostname: &str, fallback: Arc<dyn Handler>) -> Self {
        Self {
            hostname: normalize_hostname(strip_port(hostname)),
            rules: Vec::new(),
            fallback,
        }
    }

    pub fn with_rule(mut self, matcher: RuleMatcher, handler: Arc<dyn Handler>) -> Self {
        self.rules.push(UrlRule { matcher, handler });
        self
    }

    async fn dispatch(&self, mut req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        for rule in &self.rules {
            if let Some(prefix) = rule.matcher.matches(&path) {
                debug!(host = %self.hostname, path = %path, matcher = ?rule.matcher, "Rule matched");
                req.extensions_mut().insert(MatchedPrefix(prefix));
                return rule.handler.handle(req).await;
            }
        }
        self.fallback.handle(req).await
    }
}

/// Lowercase and drop a trailing dot.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Classification of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic {
    Local,
    Proxy,
}

/// Proxy-side collaborators shared by every listener.
#[derive(Clone)]
pub struct ProxyServices {
    pub dialer: Arc<Dialer>,
    pub forwarder: Arc<dyn Forwarder>,
    pub tunnels: Arc<TunnelManager>,
}

/// Per-listener request router.
pub struct Router {
    vhosts: Vec<VirtualHostRoutes>,
    default_host: VirtualHostRoutes,
    local_domains: Vec<String>,
    proxy_http1: bool,
    proxy_http2: bool,
    auth: Option<Arc<DigestAuth>>,
    forwarder: Arc<dyn Forwarder>,
    tunnels: Arc<TunnelManager>,
}

impl Router {
    pub fn new(default_host: VirtualHostRoutes, services: &ProxyServices) -> Self {
        Self {
            vhosts: Vec::new(),
            default_host,
            local_domains: Vec::new(),
            proxy_http1: false,
            proxy_http2: false,
            auth: None,
            forwarder: Arc::clone(&services.forwarder),
            tunnels: Arc::clone(&services.tunnels),
        }
    }

    /// Add a virtual host; its hostname joins the local-domain list.
    pub fn with_vhost(mut self, vhost: VirtualHostRoutes) -> Self {
        if !self.local_domains.contains(&vhost.hostname) {
            self.local_domains.push(vhost.hostname.clone());
        }
        self.vhosts.push(vhost);
        self
    }

    pub fn with_proxy(mut self, http1: bool, http2: bool) -> Self {
        self.proxy_http1 = http1;
        self.proxy_http2 = http2;
        self
    }

    pub fn with_auth(mut self, auth: Arc<DigestAuth>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn local_domains(&self) -> &[String] {
        &self.local_domains
    }

    /// Build a listener's router from its configuration.
    pub fn from_config(
        server: &ServerConfig,
        services: &ProxyServices,
        provider: Option<&dyn HandlerProvider>,
        auth: Option<Arc<DigestAuth>>,
    ) -> Result<Self, ConfigError> {
        let mut default_host =
            VirtualHostRoutes::new("", Arc::new(StaticFiles::new(&server.docroot)));
        for rule in &server.url_rules {
            let docroot = rule.docroot.as_deref().unwrap_or(&server.docroot);
            default_host.rules.push(build_rule(rule, docroot, services, provider)?);
        }

        let (http1, http2) = server.proxy_flags();
        let mut router = Router::new(default_host, services).with_proxy(http1, http2);

        for vhost_config in &server.vhost {
            let mut vhost = VirtualHostRoutes::new(
                &vhost_config.hostname,
                Arc::new(StaticFiles::new(&vhost_config.docroot)),
            );
            for rule in &vhost_config.url_rules {
                let docroot = rule.docroot.as_deref().unwrap_or(&vhost_config.docroot);
                vhost.rules.push(build_rule(rule, docroot, services, provider)?);
            }
            router = router.with_vhost(vhost);
        }

        if let Some(auth) = auth {
            router = router.with_auth(auth);
        }
        Ok(router)
    }

    /// Local or proxy-bound.
    pub fn classify<B>(&self, req: &Request<B>) -> Traffic {
        if req.method() == Method::CONNECT {
            return Traffic::Proxy;
        }

        if req.version() == Version::HTTP_2 {
            if !self.proxy_http2 || self.local_domains.is_empty() {
                return Traffic::Local;
            }
            let host = request_host(req).unwrap_or_default();
            return if self.local_domains.iter().any(|d| host.ends_with(d.as_str())) {
                Traffic::Local
            } else {
                Traffic::Proxy
            };
        }

        let target = req
            .extensions()
            .get::<RequestTarget>()
            .map(|t| t.0.clone())
            .unwrap_or_else(|| req.uri().to_string());
        if target.starts_with('/') || target == "*" {
            Traffic::Local
        } else {
            Traffic::Proxy
        }
    }

    fn select_vhost<B>(&self, req: &Request<B>) -> &VirtualHostRoutes {
        let host = request_host(req).unwrap_or_default();
        self.vhosts
            .iter()
            .find(|v| v.hostname == host)
            .unwrap_or(&self.default_host)
    }

    async fn serve_proxy(&self, req: Request<Body>) -> Response<Body> {
        let enabled = if req.version() == Version::HTTP_2 {
            self.proxy_http2
        } else {
            self.proxy_http1
        };
        if !enabled {
            debug!(uri = %req.uri(), "Proxy request on a listener with proxying disabled");
            return not_found();
        }

        if let Some(auth) = &self.auth {
            if let Err(e) = auth.check(&req) {
                debug!(error = %e, "Proxy authentication failed");
                return auth.challenge(&e);
            }
        }

        if req.method() == Method::CONNECT {
            self.tunnels.open(&req).await
        } else {
            self.forwarder.forward(req).await
        }
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match self.classify(&req) {
            Traffic::Local => self.select_vhost(&req).dispatch(req).await,
            Traffic::Proxy => self.serve_proxy(req).await,
        }
    }
}

/// Normalized host of the request (authority, else `Host`), port stripped.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .uri()
        .authority()
        .map(|a| a.host().to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|h| strip_port(h).to_string())
        })?;
    Some(normalize_hostname(strip_port(&raw)))
}

fn not_found() -> Response<Body> {
    let mut response = Response::new(body::full("<h1>404 Not Found</h1>"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

fn build_rule(
    rule: &RuleConfig,
    docroot: &std::path::Path,
    services: &ProxyServices,
    provider: Option<&dyn HandlerProvider>,
) -> Result<UrlRule, ConfigError> {
    let invalid = |detail: String| ConfigError::Rule {
        rule: rule.url_prefix.clone(),
        detail,
    };
    let target_kind = rule.target.as_ref().map(|t| t.kind);

    let matcher = if rule.is_regex {
        RuleMatcher::Regex(Regex::new(&rule.url_prefix).map_err(|e| invalid(e.to_string()))?)
    } else if rule.kind == RuleKind::Alias && target_kind == Some(TargetKind::File) {
        RuleMatcher::Exact(rule.url_prefix.clone())
    } else {
        RuleMatcher::Prefix(rule.url_prefix.clone())
    };

    let handler: Arc<dyn Handler> = match (rule.kind, rule.target.as_ref()) {
        (RuleKind::Alias, Some(target)) if target.kind == TargetKind::File => {
            Arc::new(AliasFile::new(&target.path))
        }
        (RuleKind::Alias, Some(target)) if target.kind == TargetKind::Dir => {
            Arc::new(AliasDir::new(&target.path))
        }
        (RuleKind::Reverse, Some(target)) => {
            let (backend, base_path) = match target.kind {
                TargetKind::Unix => (ReverseTarget::Unix(target.path.clone().into()), "/".to_string()),
                TargetKind::Http => (
                    ReverseTarget::Tcp {
                        host: target.host.clone(),
                        port: target.port,
                    },
                    if target.path.is_empty() {
                        "/".to_string()
                    } else {
                        target.path.clone()
                    },
                ),
                other => return Err(invalid(format!("reverse target {other:?} unsupported"))),
            };
            Arc::new(ReverseProxy::new(
                backend,
                base_path,
                Arc::clone(&services.dialer),
            ))
        }
        (RuleKind::Uwsgi | RuleKind::Fastcgi | RuleKind::Script, _) => match provider {
            Some(provider) => provider.build(rule, docroot)?,
            None => {
                warn!(rule = %rule.url_prefix, kind = rule.kind.as_str(), "No handler provider");
                return Err(ConfigError::MissingProvider {
                    kind: rule.kind.as_str().to_string(),
                });
            }
        },
        _ => return Err(invalid("rule has no usable target".to_string())),
    };

    Ok(UrlRule { matcher, handler })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use edge_networking::{Resolver, ResolverConfig};
    use http_body_util::BodyExt;

    use crate::auth::CredentialLookup;

    struct Named(&'static str);

    #[async_trait]
    impl Handler for Named {
        async fn handle(&self, req: Request<Body>) -> Response<Body> {
            let prefix = req
                .extensions()
                .get::<MatchedPrefix>()
                .map(|p| p.0.clone())
                .unwrap_or_default();
            body::text(StatusCode::OK, format!("{}|{prefix}", self.0))
        }
    }

    #[async_trait]
    impl Forwarder for Named {
        async fn forward(&self, _req: Request<Body>) -> Response<Body> {
            body::text(StatusCode::OK, self.0)
        }
    }

    struct NoUsers;

    impl CredentialLookup for NoUsers {
        fn lookup(&self, _user: &str, _realm: &str) -> Option<String> {
            None
        }
    }

    fn services() -> ProxyServices {
        let resolver = Arc::new(Resolver::new(ResolverConfig {
            servers: vec![],
            port: 53,
            timeout: Duration::from_millis(50),
            attempts: 1,
        }));
        let dialer = Arc::new(Dialer::new(resolver));
        ProxyServices {
            dialer: Arc::clone(&dialer),
            forwarder: Arc::new(Named("forwarded")),
            tunnels: Arc::new(TunnelManager::new(dialer, None)),
        }
    }

    fn sample_router() -> Router {
        let default_host = VirtualHostRoutes::new("", Arc::new(Named("static")))
            .with_rule(RuleMatcher::Prefix("/api/".into()), Arc::new(Named("reverse")))
            .with_rule(RuleMatcher::Prefix("/".into()), Arc::new(Named("alias-dir")));
        Router::new(default_host, &services())
            .with_vhost(VirtualHostRoutes::new("Example.COM:443", Arc::new(Named("vhost"))))
            .with_proxy(true, true)
    }

    fn h1(target: &str) -> Request<Body> {
        let mut req = Request::builder()
            .uri(target)
            .header(header::HOST, "edge.test")
            .body(body::empty())
            .unwrap();
        req.extensions_mut().insert(RequestTarget(target.to_string()));
        req
    }

    fn h2(uri: &str) -> Request<Body> {
        Request::builder()
            .version(Version::HTTP_2)
            .uri(uri)
            .body(body::empty())
            .unwrap()
    }

    async fn text(response: Response<Body>) -> (StatusCode, String) {
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let router = sample_router();
        assert_eq!(text(router.handle(h1("/api/x")).await).await.1, "reverse|/api");
        assert_eq!(text(router.handle(h1("/static/x")).await).await.1, "alias-dir|");
    }

    #[test]
    fn test_classification() {
        let router = sample_router();
        assert_eq!(router.local_domains().to_vec(), vec!["example.com".to_string()]);

        assert_eq!(router.classify(&h1("/index.html")), Traffic::Local);
        assert_eq!(router.classify(&h1("http://elsewhere.test/")), Traffic::Proxy);

        // Path starts with '/', but the authority is not local.
        assert_eq!(router.classify(&h2("https://elsewhere.test/")), Traffic::Proxy);
        assert_eq!(router.classify(&h2("https://www.example.com/")), Traffic::Local);

        let no_h2_proxy = sample_router().with_proxy(true, false);
        assert_eq!(no_h2_proxy.classify(&h2("https://elsewhere.test/")), Traffic::Local);

        let connect = Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(())
            .unwrap();
        assert_eq!(router.classify(&connect), Traffic::Proxy);
    }

    #[tokio::test]
    async fn test_vhost_selected_by_host() {
        let router = sample_router();
        let mut req = h1("/page");
        req.headers_mut()
            .insert(header::HOST, HeaderValue::from_static("example.com:443"));
        assert_eq!(text(router.handle(req).await).await.1, "vhost|");
    }

    #[tokio::test]
    async fn test_proxy_disabled_is_404() {
        let router = sample_router().with_proxy(false, true);
        let (status, body) = text(router.handle(h1("http://elsewhere.test/")).await).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "<h1>404 Not Found</h1>");
    }

    #[tokio::test]
    async fn test_proxy_forwards_and_checks_auth() {
        let router = sample_router();
        let (status, body) = text(router.handle(h1("http://elsewhere.test/")).await).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "forwarded"));

        let guarded = sample_router().with_auth(Arc::new(DigestAuth::new("edge", Arc::new(NoUsers))));
        let response = guarded.handle(h1("http://elsewhere.test/")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::PROXY_AUTHENTICATE));
    }

    #[tokio::test]
    async fn test_connect_dial_failure_is_503() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let target = format!("127.0.0.1:{port}");
        let mut req = Request::builder()
            .method(Method::CONNECT)
            .uri(target.as_str())
            .body(body::empty())
            .unwrap();
        req.extensions_mut().insert(RequestTarget(target.clone()));

        let (status, body) = text(sample_router().handle(req).await).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.starts_with(&format!("dial to {target} failed")));
    }

    #[test]
    fn test_regex_matcher_matches_anywhere() {
        let matcher = RuleMatcher::Regex(Regex::new(r"\.php$").unwrap());
        assert_eq!(matcher.matches("/app/index.php"), Some(String::new()));
        assert_eq!(matcher.matches("/app/index.html"), None);

        let anchored = RuleMatcher::Regex(Regex::new(r"^/app/").unwrap());
        assert_eq!(anchored.matches("/app/x"), Some("/app".to_string()));
    }

    #[test]
    fn test_missing_provider_is_config_error() {
        let rule = RuleConfig {
            url_prefix: "/cgi/".into(),
            is_regex: false,
            kind: RuleKind::Fastcgi,
            target: None,
            docroot: None,
        };
        let err = build_rule(&rule, std::path::Path::new("/srv"), &services(), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingProvider { kind } if kind == "fastcgi"));
    }
}
