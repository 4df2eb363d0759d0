
use std::path::Path;
use std::time::Duration;

use edge_gateway::{FileConfig, Gateway, ProxyHeader};
use edge_networking::ResolverConfig;
use harness::{Origin, OriginMode};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

fn no_dns() -> ResolverConfig {
    ResolverConfig {
        servers: vec![],
        port: 53,
        timeout: Duration::from_millis(50),
        attempts: 1,
    }
}

async fn start(toml: &str) -> (Gateway, watch::Sender<bool>) {
    let file = FileConfig::parse(toml, Path::new("test.toml")).unwrap();
    let gateway = Gateway::bind(&file, no_dns(), 64, None).await.unwrap();
    let (tx, rx) = watch::channel(false);
    gateway.spawn(&rx);
    (gateway, tx)
}

async fn get(
    addr: std::net::SocketAddr,
    prefix: &[u8],
    path: &str,
    host: &str,
) -> (String, String) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(prefix).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();
    harness::read_response(&mut client).await
}

#[tokio::test]
async fn serves_docroot_vhost_and_alias_rules() {
    let dir = tempfile::tempdir().unwrap();
    let default_root = dir.path().join("default");
    let vhost_root = dir.path().join("vhost");
    std::fs::create_dir_all(&default_root).unwrap();
    std::fs::create_dir_all(&vhost_root).unwrap();
    std::fs::write(default_root.join("index.html"), "default-home").unwrap();
    std::fs::write(vhost_root.join("index.html"), "vhost-home").unwrap();
    std::fs::write(dir.path().join("robots.txt"), "User-agent: *").unwrap();

    let toml = format!(
        r#"
[[server]]
host = "127.0.0.1"
port = 0
docroot = "{default}"

  [[server.url_rules]]
  url_prefix = "/robots.txt"
  type = "alias"
  target = {{ type = "file", path = "{robots}" }}

  [[server.vhost]]
  hostname = "site.test"
  docroot = "{vhost}"
"#,
        default = default_root.display(),
        vhost = vhost_root.display(),
        robots = dir.path().join("robots.txt").display(),
    );
    let (gateway, _shutdown) = start(&toml).await;
    let addr = gateway.listeners()[0].local_addr().unwrap();

    assert_eq!(get(addr, b"", "/", "other.test").await.1, "default-home");
    assert_eq!(get(addr, b"", "/", "Site.Test:80").await.1, "vhost-home");
    assert_eq!(get(addr, b"", "/robots.txt", "other.test").await.1, "User-agent: *");

    let (head, _) = get(addr, b"", "/missing.html", "other.test").await;
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");
}

#[tokio::test]
async fn reverse_rule_sees_proxy_protocol_client() {
    let origin = Origin::spawn(OriginMode::EchoHead).await;
    let toml = format!(
        r#"
[[server]]
host = "127.0.0.1"
port = 0

  [[server.url_rules]]
  url_prefix = "/api/"
  type = "reverse"
  target = {{ type = "http", host = "127.0.0.1", port = {port}, path = "/backend" }}
"#,
        port = origin.addr.port(),
    );
    let (gateway, _shutdown) = start(&toml).await;
    let addr = gateway.listeners()[0].local_addr().unwrap();

    let prefix = ProxyHeader::encode_v2(
        "203.0.113.7:51000".parse().unwrap(),
        "198.51.100.1:443".parse().unwrap(),
    )
    .unwrap();
    let (head, echoed) = get(addr, &prefix, "/api/users?id=3", "app.test").await;

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(!head.to_ascii_lowercase().contains("connection:"), "{head}");
    let echoed = echoed.to_ascii_lowercase();
    assert!(echoed.starts_with("get /backend/users?id=3 http/1.1"), "{echoed}");
    assert!(echoed.contains("x-forwarded-for: 203.0.113.7"), "{echoed}");
    assert_eq!(origin.request_count(), 1);
    assert_eq!(
        gateway.listeners()[0]
            .stats()
            .proxy_headers
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn absolute_form_request_is_forwarded_directly() {
    let origin = Origin::spawn(OriginMode::EchoHead).await;
    let toml = r#"
[[server]]
host = "127.0.0.1"
port = 0
enable_proxy = true
"#;
    let (gateway, _shutdown) = start(toml).await;
    let addr = gateway.listeners()[0].local_addr().unwrap();

    let url = format!("http://{}/direct", origin.addr);
    let (head, echoed) = get(addr, b"", &url, &origin.addr.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(echoed.starts_with("GET /direct HTTP/1.1"), "{echoed}");
}

#[tokio::test]
async fn auth_required_for_proxy_requests() {
    let dir = tempfile::tempdir().unwrap();
    let passwd = dir.path().join("htdigest");
    std::fs::write(&passwd, "alice:edge:0123456789abcdef0123456789abcdef\n").unwrap();

    let toml = format!(
        r#"
[[server]]
host = "127.0.0.1"
port = 0
enable_proxy = true
enable_auth = true
realm = "edge"
passwd_file = "{}"
"#,
        passwd.display()
    );
    let (gateway, _shutdown) = start(&toml).await;
    let addr = gateway.listeners()[0].local_addr().unwrap();

    let (head, _) = get(addr, b"", "http://origin.test/", "origin.test").await;
    assert!(head.starts_with("HTTP/1.1 401"), "{head}");
    assert!(head.contains("Digest realm=\"edge\""), "{head}");
}
