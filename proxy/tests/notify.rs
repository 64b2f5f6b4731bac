mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{config, template, FakeNode, MemoryStore};
use stratum_proxy::{notify, ProxyServer};

async fn listen(server: &Arc<ProxyServer>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(notify::serve(listener, Arc::clone(server)));
    addr
}

/// One HTTP/1.1 exchange; returns (status, body).
async fn request(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, path
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn post_triggers_refresh() {
    let node = FakeNode::new("node");
    node.set_template(Some(template('a', 7)));
    let store = Arc::new(MemoryStore::default());
    let server = common::server(config("Stratum-Proxy"), &node, &store);
    let addr = listen(&server).await;

    let (status, _) = request(addr, "POST", "/").await;
    assert_eq!(status, 200);
    assert_eq!(node.fetches(), 1);
    assert_eq!(server.current_template().unwrap().height, 7);
}

#[tokio::test]
async fn other_methods_are_refused() {
    let node = FakeNode::new("node");
    let store = Arc::new(MemoryStore::default());
    let server = common::server(config("Stratum-Proxy"), &node, &store);
    let addr = listen(&server).await;

    let (status, body) = request(addr, "GET", "/").await;
    assert_eq!(status, 405);
    assert!(body.contains("rpc: POST method required, received GET"));
    assert_eq!(node.fetches(), 0);
}

#[tokio::test]
async fn health_reflects_fail_count() {
    let node = FakeNode::new("node");
    let store = Arc::new(MemoryStore::default());
    let server = common::server(config("Stratum-Proxy"), &node, &store);
    let addr = listen(&server).await;

    let (status, body) = request(addr, "GET", "/health").await;
    assert_eq!(status, 200);
    assert!(body.contains("\"status\":\"ok\""));

    // max_fails is 2 and the node has no work
    server.refresh_template().await;
    server.refresh_template().await;

    let (status, body) = request(addr, "GET", "/health").await;
    assert_eq!(status, 503);
    assert!(body.contains("\"fails\":2"));
}

#[tokio::test]
async fn metrics_are_exposed() {
    let node = FakeNode::new("node");
    let store = Arc::new(MemoryStore::default());
    let server = common::server(config("Stratum-Proxy"), &node, &store);
    let addr = listen(&server).await;

    request(addr, "POST", "/").await;
    let (status, body) = request(addr, "GET", "/metrics").await;
    assert_eq!(status, 200);
    assert!(body.contains("work_notifications_total"));
}
