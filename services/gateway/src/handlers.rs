//! Local request handlers: static files, aliases and reverse proxies.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use edge_networking::Dialer;
use http::header::{self, HeaderValue};
use http::uri::PathAndQuery;
use http::{Method, Request, Response, StatusCode, Uri};
use mime_guess::mime;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::body::{self, Body};
use crate::error::ForwardError;
use crate::forward;
use crate::proxy::{BoxedIo, ClientAddr};
use crate::router::{Handler, MatchedPrefix};

const INDEX_FILE: &str = "index.html";

/// `Content-Type` for a served file. Text types are declared UTF-8.
fn content_type(path: &Path) -> HeaderValue {
    let guessed = mime_guess::from_path(path).first_or_octet_stream();
    let is_text = guessed.type_() == mime::TEXT;
    let value = if is_text && guessed.get_param(mime::CHARSET).is_none() {
        format!("{guessed}; charset=utf-8")
    } else {
        guessed.to_string()
    };
    HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

/// Map a request path onto `root`. `None` if the path escapes it.
fn resolve_under(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for segment in request_path.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." || segment.contains('\\') || segment.contains('\0') {
            return None;
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => resolved.push(part),
            _ => return None,
        }
    }
    Some(resolved)
}

async fn serve_file(path: &Path, method: &Method) -> Response<Body> {
    if method != Method::GET && method != Method::HEAD {
        let mut response = body::text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let mut path = path.to_path_buf();
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.push(INDEX_FILE),
        Ok(_) => {}
        Err(e) => return io_error_response(&path, e),
    }

    match tokio::fs::read(&path).await {
        Ok(contents) => {
            let mut response = Response::new(body::full(contents));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type(&path));
            response
        }
        Err(e) => io_error_response(&path, e),
    }
}

fn io_error_response(path: &Path, e: io::Error) -> Response<Body> {
    match e.kind() {
        io::ErrorKind::NotFound => body::text(StatusCode::NOT_FOUND, "404 page not found"),
        io::ErrorKind::PermissionDenied => body::text(StatusCode::FORBIDDEN, "403 Forbidden"),
        _ => {
            warn!(path = %path.display(), error = %e, "File read failed");
            body::text(StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error")
        }
    }
}

/// Request path with the matched rule prefix removed.
fn stripped_path<B>(req: &Request<B>) -> String {
    let path = req.uri().path();
    let prefix = req
        .extensions()
        .get::<MatchedPrefix>()
        .map(|p| p.0.as_str())
        .unwrap_or("");
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

/// Serves a document root.
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Handler for StaticFiles {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match resolve_under(&self.root, req.uri().path()) {
            Some(path) => serve_file(&path, req.method()).await,
            None => body::text(StatusCode::BAD_REQUEST, "invalid path"),
        }
    }
}

/// Serves one file for every matching request.
pub struct AliasFile {
    path: PathBuf,
}

impl AliasFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Handler for AliasFile {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        serve_file(&self.path, req.method()).await
    }
}

/// Serves a directory under the rule prefix.
pub struct AliasDir {
    root: PathBuf,
}

impl AliasDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Handler for AliasDir {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match resolve_under(&self.root, &stripped_path(&req)) {
            Some(path) => serve_file(&path, req.method()).await,
            None => body::text(StatusCode::BAD_REQUEST, "invalid path"),
        }
    }
}

/// Reverse-proxy backend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReverseTarget {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

/// Forwards to an HTTP/1.1 backend with the rule prefix stripped and the
/// backend base path joined in front.
pub struct ReverseProxy {
    target: ReverseTarget,
    base_path: String,
    dialer: Arc<Dialer>,
}

impl ReverseProxy {
    pub fn new(target: ReverseTarget, base_path: impl Into<String>, dialer: Arc<Dialer>) -> Self {
        Self {
            target,
            base_path: base_path.into(),
            dialer,
        }
    }

    async fn connect(&self) -> Result<BoxedIo, ForwardError> {
        let io: BoxedIo = match &self.target {
            ReverseTarget::Unix(path) => Box::new(UnixStream::connect(path).await?),
            ReverseTarget::Tcp { host, port } => Box::new(self.dialer.dial_host(host, *port).await?),
        };
        Ok(io)
    }

    async fn try_forward(&self, req: Request<Body>) -> Result<Response<Body>, ForwardError> {
        let backend_path = join_paths(&self.base_path, &stripped_path(&req));
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{backend_path}?{query}"),
            None => backend_path,
        };
        let client = req.extensions().get::<ClientAddr>().map(|c| c.0.ip());

        let (mut parts, body) = req.into_parts();
        let host = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| match &self.target {
                ReverseTarget::Tcp { host, port } => format!("{host}:{port}"),
                ReverseTarget::Unix(_) => "localhost".to_string(),
            });
        parts.uri = Uri::from(
            PathAndQuery::try_from(path_and_query)
                .map_err(|e| ForwardError::InvalidTarget(e.to_string()))?,
        );
        forward::to_origin_form(&mut parts, &host);

        if let Some(ip) = client {
            let forwarded = match parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(prior) => format!("{prior}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                parts.headers.insert("x-forwarded-for", value);
            }
        }

        let io = self.connect().await?;
        debug!(backend = ?self.target, path = %parts.uri, "Reverse proxying");
        forward::http1_exchange(io, Request::from_parts(parts, body)).await
    }
}

#[async_trait]
impl Handler for ReverseProxy {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match self.try_forward(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(backend = ?self.target, error = %e, "Reverse proxy failed");
                body::text(StatusCode::BAD_GATEWAY, e.to_string())
            }
        }
    }
}

/// Join two paths with exactly one slash between them.
fn join_paths(base: &str, rest: &str) -> String {
    match (base.ends_with('/'), rest.starts_with('/')) {
        (true, true) => format!("{base}{}", &rest[1..]),
        (false, false) => format!("{base}/{rest}"),
        _ => format!("{base}{rest}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn read(response: Response<Body>) -> (StatusCode, String) {
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(body::empty()).unwrap()
    }

    #[test]
    fn test_resolve_under_rejects_traversal() {
        let root = Path::new("/srv/www");
        assert_eq!(
            resolve_under(root, "/a/./b.html"),
            Some(PathBuf::from("/srv/www/a/b.html"))
        );
        assert_eq!(resolve_under(root, "/a/../../etc/passwd"), None);
        assert_eq!(resolve_under(root, "/a\\b"), None);
    }

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type(Path::new("v.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("data.csv")), "text/csv; charset=utf-8");
        assert_eq!(content_type(Path::new("a.PNG")), "image/png");
        assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/x"), "/x");
        assert_eq!(join_paths("/base", "/x"), "/base/x");
        assert_eq!(join_paths("/base/", "/x"), "/base/x");
        assert_eq!(join_paths("/base", "x"), "/base/x");
    }

    #[tokio::test]
    async fn test_static_files_serves_index_and_404() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>home</p>").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.css"), "body{}").unwrap();

        let files = StaticFiles::new(dir.path());
        assert_eq!(read(files.handle(get("/")).await).await, (StatusCode::OK, "<p>home</p>".into()));

        let response = files.handle(get("/docs/a.css")).await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css; charset=utf-8");

        assert_eq!(read(files.handle(get("/missing")).await).await.0, StatusCode::NOT_FOUND);
        assert_eq!(read(files.handle(get("/docs")).await).await.0, StatusCode::NOT_FOUND);

        let post = Request::post("/").body(body::empty()).unwrap();
        assert_eq!(files.handle(post).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_alias_dir_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "run()").unwrap();

        let alias = AliasDir::new(dir.path());
        let mut req = get("/static/app.js");
        req.extensions_mut().insert(MatchedPrefix("/static".into()));
        assert_eq!(read(alias.handle(req).await).await, (StatusCode::OK, "run()".into()));
    }

    #[tokio::test]
    async fn test_alias_file_ignores_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("robots.txt");
        std::fs::write(&file, "User-agent: *").unwrap();

        let alias = AliasFile::new(&file);
        let (status, text) = read(alias.handle(get("/robots.txt")).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "User-agent: *");
    }
}
