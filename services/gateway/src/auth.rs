//! Digest authentication for proxy traffic.
//!
//! Credentials come from a [`CredentialLookup`]; [`HtdigestFile`] is the
//! file-backed implementation (`user:realm:ha1` lines, as written by
//! `htdigest`). [`DigestAuth`] verifies RFC 2617 `Digest` credentials with
//! MD5, for `qop=auth` and the legacy no-qop form.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode};
use md5::{Digest, Md5};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::body::{self, Body};
use crate::error::{AuthError, ConfigError};

/// How often the credential file is checked for changes.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(10);

/// Nonces older than this are answered with `stale=true`.
pub const NONCE_TTL: Duration = Duration::from_secs(300);

/// Upper bound on outstanding nonces.
const MAX_NONCES: usize = 10_000;

/// Look up the HA1 digest (`md5(user:realm:password)`, hex) for a user.
pub trait CredentialLookup: Send + Sync {
    fn lookup(&self, user: &str, realm: &str) -> Option<String>;
}

#[derive(Default)]
struct Entries {
    by_user: HashMap<(String, String), String>,
    mtime: Option<SystemTime>,
}

/// `htdigest` credential file, re-read when its mtime changes.
pub struct HtdigestFile {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl HtdigestFile {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = Self {
            path: path.as_ref().to_path_buf(),
            entries: Mutex::new(Entries::default()),
        };
        file.reload().await.map_err(|source| ConfigError::Read {
            path: file.path.clone(),
            source,
        })?;
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.by_user.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the file if its mtime differs from the last load.
    pub async fn reload_if_changed(&self) -> std::io::Result<bool> {
        let mtime = tokio::fs::metadata(&self.path).await?.modified().ok();
        let current = self.entries.lock().ok().and_then(|e| e.mtime);
        if mtime.is_some() && mtime == current {
            return Ok(false);
        }
        self.reload().await?;
        Ok(true)
    }

    async fn reload(&self) -> std::io::Result<()> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mtime = tokio::fs::metadata(&self.path).await?.modified().ok();
        let by_user = parse_htdigest(&content);
        let count = by_user.len();

        if let Ok(mut entries) = self.entries.lock() {
            *entries = Entries { by_user, mtime };
        }
        debug!(path = %self.path.display(), entries = count, "Loaded credential file");
        Ok(())
    }

    /// Check for changes every [`RELOAD_INTERVAL`] until shutdown.
    pub fn spawn_reload(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RELOAD_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.reload_if_changed().await {
                        Ok(true) => info!(path = %self.path.display(), "Credential file reloaded"),
                        Ok(false) => {}
                        Err(e) => warn!(path = %self.path.display(), error = %e, "Credential file reload failed"),
                    },
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

impl CredentialLookup for HtdigestFile {
    fn lookup(&self, user: &str, realm: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .by_user
            .get(&(user.to_string(), realm.to_string()))
            .cloned()
    }
}

fn parse_htdigest(content: &str) -> HashMap<(String, String), String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.splitn(3, ':');
            let user = fields.next()?;
            let realm = fields.next()?;
            let ha1 = fields.next()?;
            Some(((user.to_string(), realm.to_string()), ha1.to_ascii_lowercase()))
        })
        .collect()
}

/// Parsed `Digest` credentials.
#[derive(Debug, Default, PartialEq, Eq)]
struct Credentials {
    username: String,
    realm: String,
    nonce: String,
    uri: String,
    response: String,
    qop: Option<String>,
    nc: Option<String>,
    cnonce: Option<String>,
}

fn parse_credentials(value: &str) -> Result<Credentials, AuthError> {
    let rest = value
        .trim()
        .strip_prefix("Digest ")
        .or_else(|| value.trim().strip_prefix("digest "))
        .ok_or(AuthError::Malformed("not a digest scheme"))?;

    let mut creds = Credentials::default();
    for (key, val) in split_params(rest) {
        match key.to_ascii_lowercase().as_str() {
            "username" => creds.username = val,
            "realm" => creds.realm = val,
            "nonce" => creds.nonce = val,
            "uri" => creds.uri = val,
            "response" => creds.response = val.to_ascii_lowercase(),
            "qop" => creds.qop = Some(val),
            "nc" => creds.nc = Some(val),
            "cnonce" => creds.cnonce = Some(val),
            _ => {}
        }
    }

    if creds.username.is_empty() || creds.nonce.is_empty() || creds.response.is_empty() {
        return Err(AuthError::Malformed("missing username, nonce or response"));
    }
    Ok(creds)
}

/// `key=value` pairs separated by commas; values may be quoted.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.push((key.trim().to_string(), value.trim().to_string()));
    }
    params
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

struct NonceState {
    issued: Instant,
    last_nc: u64,
    used: bool,
}

/// Digest authenticator for one realm.
pub struct DigestAuth {
    realm: String,
    lookup: Arc<dyn CredentialLookup>,
    nonces: Mutex<HashMap<String, NonceState>>,
    max_nonces: usize,
}

impl DigestAuth {
    pub fn new(realm: impl Into<String>, lookup: Arc<dyn CredentialLookup>) -> Self {
        Self {
            realm: realm.into(),
            lookup,
            nonces: Mutex::new(HashMap::new()),
            max_nonces: MAX_NONCES,
        }
    }

    /// Cap on outstanding nonces (at least one).
    pub fn with_nonce_capacity(mut self, capacity: usize) -> Self {
        self.max_nonces = capacity.max(1);
        self
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Verify the request's credentials, read from `Proxy-Authorization`
    /// and then `Authorization`. Returns the authenticated user.
    pub fn check<B>(&self, req: &Request<B>) -> Result<String, AuthError> {
        let value = req
            .headers()
            .get(header::PROXY_AUTHORIZATION)
            .or_else(|| req.headers().get(header::AUTHORIZATION))
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Missing)?;
        let creds = parse_credentials(value)?;

        if creds.realm != self.realm {
            return Err(AuthError::UnknownUser {
                user: creds.username,
                realm: creds.realm,
            });
        }
        let ha1 = self
            .lookup
            .lookup(&creds.username, &self.realm)
            .ok_or_else(|| AuthError::UnknownUser {
                user: creds.username.clone(),
                realm: self.realm.clone(),
            })?;

        let nc = match &creds.qop {
            Some(qop) if qop == "auth" => {
                let nc = creds
                    .nc
                    .as_deref()
                    .and_then(|nc| u64::from_str_radix(nc, 16).ok())
                    .ok_or(AuthError::Malformed("invalid nonce count"))?;
                if creds.cnonce.as_deref().unwrap_or("").is_empty() {
                    return Err(AuthError::Malformed("missing cnonce"));
                }
                Some(nc)
            }
            Some(_) => return Err(AuthError::Malformed("unsupported qop")),
            None => None,
        };

        let ha2 = md5_hex(&format!("{}:{}", req.method(), creds.uri));
        let expected = match nc {
            Some(_) => md5_hex(&format!(
                "{ha1}:{}:{}:{}:auth:{ha2}",
                creds.nonce,
                creds.nc.as_deref().unwrap_or(""),
                creds.cnonce.as_deref().unwrap_or("")
            )),
            None => md5_hex(&format!("{ha1}:{}:{ha2}", creds.nonce)),
        };
        if expected != creds.response {
            return Err(AuthError::Mismatch);
        }

        self.accept_nonce(&creds.nonce, nc)?;
        Ok(creds.username)
    }

    fn accept_nonce(&self, nonce: &str, nc: Option<u64>) -> Result<(), AuthError> {
        let mut nonces = self.nonces.lock().map_err(|_| AuthError::StaleNonce)?;
        let state = nonces.get_mut(nonce).ok_or(AuthError::StaleNonce)?;
        if state.issued.elapsed() > NONCE_TTL {
            nonces.remove(nonce);
            return Err(AuthError::StaleNonce);
        }
        if let Some(nc) = nc {
            if nc <= state.last_nc {
                return Err(AuthError::Replay);
            }
            state.last_nc = nc;
        }
        state.used = true;
        Ok(())
    }

    /// Issue a fresh nonce, dropping expired ones.
    ///
    /// At capacity the oldest nonce no client has answered is evicted, so
    /// a burst of unanswered challenges cannot invalidate live sessions.
    pub fn issue_nonce(&self) -> String {
        let bytes: [u8; 16] = rand::rng().random();
        let nonce = hex::encode(bytes);
        if let Ok(mut nonces) = self.nonces.lock() {
            nonces.retain(|_, state| state.issued.elapsed() <= NONCE_TTL);
            while nonces.len() >= self.max_nonces {
                let Some(victim) = eviction_candidate(&nonces) else {
                    break;
                };
                nonces.remove(&victim);
            }
            nonces.insert(
                nonce.clone(),
                NonceState {
                    issued: Instant::now(),
                    last_nc: 0,
                    used: false,
                },
            );
        }
        nonce
    }

    /// `401` carrying a `Digest` challenge in both `WWW-Authenticate` and
    /// `Proxy-Authenticate`.
    pub fn challenge(&self, error: &AuthError) -> Response<Body> {
        let stale = matches!(error, AuthError::StaleNonce);
        let mut value = format!(
            "Digest realm=\"{}\", nonce=\"{}\", qop=\"auth\", algorithm=MD5",
            self.realm,
            self.issue_nonce()
        );
        if stale {
            value.push_str(", stale=true");
        }

        let mut response = body::text(StatusCode::UNAUTHORIZED, "authentication required");
        if let Ok(value) = HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value.clone());
            response
                .headers_mut()
                .insert(header::PROXY_AUTHENTICATE, value);
        }
        response
    }
}

/// Oldest unused nonce, else the oldest overall.
fn eviction_candidate(nonces: &HashMap<String, NonceState>) -> Option<String> {
    nonces
        .iter()
        .min_by_key(|(_, state)| (state.used, state.issued))
        .map(|(nonce, _)| nonce.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Static(&'static str);

    impl CredentialLookup for Static {
        fn lookup(&self, user: &str, realm: &str) -> Option<String> {
            (user == "alice" && realm == "edge").then(|| self.0.to_string())
        }
    }

    fn ha1() -> String {
        md5_hex("alice:edge:secret")
    }

    fn auth() -> DigestAuth {
        let ha1: &'static str = Box::leak(ha1().into_boxed_str());
        DigestAuth::new("edge", Arc::new(Static(ha1)))
    }

    fn request(header_value: String) -> Request<()> {
        Request::get("http://origin.test/x")
            .header(header::PROXY_AUTHORIZATION, header_value)
            .body(())
            .unwrap()
    }

    fn qop_header(nonce: &str, nc: &str, password_ha1: &str) -> String {
        let ha2 = md5_hex("GET:http://origin.test/x");
        let response = md5_hex(&format!("{password_ha1}:{nonce}:{nc}:c0ffee:auth:{ha2}"));
        format!(
            "Digest username=\"alice\", realm=\"edge\", nonce=\"{nonce}\", \
             uri=\"http://origin.test/x\", qop=auth, nc={nc}, cnonce=\"c0ffee\", \
             response=\"{response}\""
        )
    }

    #[test]
    fn test_accepts_valid_qop_auth() {
        let auth = auth();
        let nonce = auth.issue_nonce();
        let user = auth.check(&request(qop_header(&nonce, "00000001", &ha1()))).unwrap();
        assert_eq!(user, "alice");
    }

    #[test]
    fn test_rejects_replayed_nonce_count() {
        let auth = auth();
        let nonce = auth.issue_nonce();
        auth.check(&request(qop_header(&nonce, "00000001", &ha1())))
            .unwrap();
        assert_eq!(
            auth.check(&request(qop_header(&nonce, "00000001", &ha1()))),
            Err(AuthError::Replay)
        );
        assert!(auth
            .check(&request(qop_header(&nonce, "00000002", &ha1())))
            .is_ok());
    }

    #[test]
    fn test_rejects_wrong_password_and_unknown_nonce() {
        let auth = auth();
        let nonce = auth.issue_nonce();
        let wrong = md5_hex("alice:edge:guess");
        assert_eq!(
            auth.check(&request(qop_header(&nonce, "00000001", &wrong))),
            Err(AuthError::Mismatch)
        );
        assert_eq!(
            auth.check(&request(qop_header("deadbeef", "00000001", &ha1()))),
            Err(AuthError::StaleNonce)
        );
    }

    #[test]
    fn test_unanswered_challenges_do_not_evict_live_nonce() {
        let auth = auth().with_nonce_capacity(4);
        let nonce = auth.issue_nonce();
        auth.check(&request(qop_header(&nonce, "00000001", &ha1())))
            .unwrap();

        for _ in 0..20 {
            auth.issue_nonce();
        }

        assert!(auth
            .check(&request(qop_header(&nonce, "00000002", &ha1())))
            .is_ok());
        assert_eq!(auth.nonces.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_legacy_no_qop() {
        let auth = auth();
        let nonce = auth.issue_nonce();
        let ha2 = md5_hex("GET:/x");
        let response = md5_hex(&format!("{}:{nonce}:{ha2}", ha1()));
        let value = format!(
            "Digest username=\"alice\", realm=\"edge\", nonce=\"{nonce}\", uri=\"/x\", response=\"{response}\""
        );
        assert_eq!(auth.check(&request(value)).unwrap(), "alice");
    }

    #[test]
    fn test_missing_credentials_and_challenge() {
        let auth = auth();
        let req = Request::get("http://origin.test/").body(()).unwrap();
        let err = auth.check(&req).unwrap_err();
        assert_eq!(err, AuthError::Missing);

        let response = auth.challenge(&err);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let www = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert!(www.starts_with("Digest realm=\"edge\", nonce=\""));
        assert_eq!(
            response.headers()[header::PROXY_AUTHENTICATE],
            response.headers()[header::WWW_AUTHENTICATE]
        );
    }

    #[test]
    fn test_split_params_handles_quotes() {
        let params = split_params(r#"a="x, y", b=plain,c="q\"z""#);
        assert_eq!(
            params,
            vec![
                ("a".to_string(), "x, y".to_string()),
                ("b".to_string(), "plain".to_string()),
                ("c".to_string(), "q\"z".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_htdigest_file_loads_and_reloads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment\n\nalice:edge:{}", ha1()).unwrap();
        file.flush().unwrap();

        let store = HtdigestFile::open(file.path()).await.unwrap();
        assert_eq!(store.lookup("alice", "edge"), Some(ha1()));
        assert_eq!(store.lookup("alice", "other"), None);
        assert!(!store.reload_if_changed().await.unwrap());

        std::fs::write(file.path(), "bob:edge:abc\n").unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(file.path())
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(store.reload_if_changed().await.unwrap());
        assert_eq!(store.lookup("alice", "edge"), None);
        assert_eq!(store.lookup("bob", "edge"), Some("abc".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HtdigestFile::open(dir.path().join("absent")).await;
        assert!(matches!(err, Err(ConfigError::Read { .. })));
    }
}
