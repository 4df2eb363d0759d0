
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use edge_gateway::body;
use edge_gateway::Forwarder;
use edge_gateway::ParentForwarder;
use harness::{pool_for, proxy_router, services, FrozenH2, GatewayHandle, Origin, OriginMode};
use http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[tokio::test]
async fn concurrent_callers_share_one_session() {
    let parent = GatewayHandle::spawn_parent("parent.test").await;
    let pool = Arc::new(pool_for(parent.addr, "parent.test"));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            pool.get_connection().await.unwrap().id()
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(pool.dial_count(), 1);
}

#[tokio::test]
async fn invalidated_session_is_redialed() {
    let parent = GatewayHandle::spawn_parent("parent.test").await;
    let pool = pool_for(parent.addr, "parent.test");

    let first = pool.get_connection().await.unwrap();
    assert_eq!(pool.get_connection().await.unwrap().id(), first.id());

    pool.invalidate(first.id()).await;
    let second = pool.get_connection().await.unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(pool.dial_count(), 2);
}

#[tokio::test]
async fn healthy_session_answers_liveness_ping() {
    let parent = GatewayHandle::spawn_parent("parent.test").await;
    let pool = pool_for(parent.addr, "parent.test");

    let session = pool.get_connection().await.unwrap();
    assert!(pool.check_liveness().await);
    assert_eq!(pool.get_connection().await.unwrap().id(), session.id());
    assert_eq!(pool.dial_count(), 1);
}

#[tokio::test]
async fn failed_liveness_ping_forces_redial() {
    let frozen = FrozenH2::spawn("frozen.test").await;
    let pool =
        pool_for(frozen.addr, "frozen.test").with_ping_timeout(Duration::from_millis(200));

    let first = pool.get_connection().await.unwrap();
    assert!(!pool.check_liveness().await);
    assert!(pool
        .last_error()
        .await
        .is_some_and(|e| e.contains("liveness")));

    let second = pool.get_connection().await.unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(pool.dial_count(), 2);
    assert_eq!(frozen.accepted.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn parent_forward_strips_connection_close() {
    let origin = Origin::spawn(OriginMode::Close).await;
    let parent = GatewayHandle::spawn_parent("parent.test").await;
    let forwarder = ParentForwarder::new(Arc::new(pool_for(parent.addr, "parent.test")));

    let req = Request::get(format!("http://{}/x", origin.addr))
        .body(body::empty())
        .unwrap();
    let response = forwarder.forward(req).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONNECTION).is_none());
    assert_eq!(response.headers()["x-origin"], "yes");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"hello");
    assert_eq!(origin.request_count(), 1);
}

#[tokio::test]
async fn chained_http1_proxy_request_keeps_connection_open() {
    let origin = Origin::spawn(OriginMode::Close).await;
    let parent = GatewayHandle::spawn_parent("parent.test").await;
    let pool = Arc::new(pool_for(parent.addr, "parent.test"));
    let gateway = GatewayHandle::spawn(proxy_router(&services(Some(pool)), "edge.test"), None).await;

    let mut client = TcpStream::connect(gateway.addr).await.unwrap();
    for _ in 0..2 {
        let request = format!(
            "GET http://{0}/x HTTP/1.1\r\nHost: {0}\r\nProxy-Connection: keep-alive\r\n\r\n",
            origin.addr
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let (head, body) = harness::read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        assert!(!head.to_ascii_lowercase().contains("connection:"), "{head}");
        assert_eq!(body, "hello");
    }
    assert_eq!(origin.request_count(), 2);
}

#[tokio::test]
async fn unreachable_parent_yields_503() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let pool = Arc::new(pool_for(
        format!("127.0.0.1:{port}").parse().unwrap(),
        "parent.test",
    ));
    let forwarder = ParentForwarder::new(Arc::clone(&pool));

    let req = Request::get("http://origin.test/").body(body::empty()).unwrap();
    let response = forwarder.forward(req).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(pool.dial_count(), 2);
}
