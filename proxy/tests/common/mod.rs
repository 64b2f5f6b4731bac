#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use stratum_proxy::blockchain::BlockTemplate;
use stratum_proxy::policy::AllowAll;
use stratum_proxy::storage::NodeStateStore;
use stratum_proxy::upstream::Upstream;
use stratum_proxy::{Config, ProxyServer};

pub struct FakeNode {
    name: String,
    pub healthy: AtomicBool,
    pub template: Mutex<Option<BlockTemplate>>,
    pub accept: AtomicBool,
    pub fetches: AtomicU32,
    pub submissions: Mutex<Vec<(String, String, String)>>,
}

impl FakeNode {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            healthy: AtomicBool::new(true),
            template: Mutex::new(None),
            accept: AtomicBool::new(true),
            fetches: AtomicU32::new(0),
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_template(&self, template: Option<BlockTemplate>) {
        *self.template.lock() = template;
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for FakeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        "http://fake"
    }

    async fn check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn fetch_template(&self) -> Result<BlockTemplate> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.template.lock().clone().ok_or_else(|| anyhow!("no work"))
    }

    async fn submit_work(&self, nonce: &str, header: &str, mix_digest: &str) -> Result<bool> {
        self.submissions
            .lock()
            .push((nonce.to_string(), header.to_string(), mix_digest.to_string()));
        Ok(self.accept.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub writes: Mutex<Vec<(String, u64, i64)>>,
}

#[async_trait]
impl NodeStateStore for MemoryStore {
    async fn write_node_state(&self, name: &str, height: u64, difficulty: i64) -> Result<()> {
        self.writes.lock().push((name.to_string(), height, difficulty));
        Ok(())
    }
}

pub fn config(protocol: &str) -> Config {
    let mut cfg = Config::from_json(
        r#"{
            "name": "test",
            "upstream": [{ "name": "node", "url": "http://127.0.0.1:8545" }],
            "proxy": {
                "listen": "127.0.0.1:0",
                "health_check": true,
                "max_fails": 2,
                "stratum": { "enabled": true, "listen": "127.0.0.1:0", "min_diff_float": 0.5, "max_diff_float": 8.0 }
            }
        }"#,
    )
    .unwrap();
    cfg.proxy.stratum.protocol = protocol.to_string();
    cfg.proxy.stratum.vardiff.enabled = false;
    cfg
}

pub fn template(c: char, height: u64) -> BlockTemplate {
    BlockTemplate {
        header: format!("0x{}", c.to_string().repeat(64)),
        seed: format!("0x{}", "5".repeat(64)),
        target: format!("0x00000000{}", "f".repeat(56)),
        height,
        difficulty: 4_294_967_296,
        timestamp: 0,
    }
}

pub fn server(cfg: Config, node: &Arc<FakeNode>, store: &Arc<MemoryStore>) -> Arc<ProxyServer> {
    ProxyServer::new(
        cfg,
        vec![Arc::clone(node) as Arc<dyn Upstream>],
        Arc::clone(store) as Arc<dyn NodeStateStore>,
        Arc::new(AllowAll),
    )
    .unwrap()
}

/// Line-oriented JSON client for a stratum listener.
pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        Self { lines: BufReader::new(r).lines(), writer: w }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Raw bytes with no line terminator. Write errors are ignored since the
    /// server may hang up mid-stream.
    pub async fn send_unterminated(&mut self, bytes: &[u8]) {
        let _ = self.writer.write_all(bytes).await;
        let _ = self.writer.flush().await;
    }

    pub async fn send(&mut self, msg: Value) {
        self.send_raw(&msg.to_string()).await;
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Next frame, or `None` once the server closed the connection.
    pub async fn recv_or_eof(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for close")
            .ok()
            .flatten()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    pub async fn expect_closed(&mut self) {
        while self.recv_or_eof().await.is_some() {}
    }
}
