/// Upstream node JSON-RPC client
///
/// Speaks JSON-RPC 2.0 over HTTP to an ethash node (`eth_getWork`,
/// `eth_submitWork`). Consecutive failures are counted so a node that keeps
/// erroring reports itself unhealthy until a call succeeds again.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::template::BlockTemplate;
use crate::metrics::prometheus as metrics;
use crate::upstream::Upstream;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

/// Failure accounting for one node.
#[derive(Debug, Default)]
struct NodeHealth {
    failures: AtomicU32,
}

impl NodeHealth {
    const MAX_FAILURES: u32 = 5;

    fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == Self::MAX_FAILURES {
            tracing::warn!("Upstream marked sick after {} consecutive failures", failures);
        }
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn is_sick(&self) -> bool {
        self.failures.load(Ordering::Relaxed) >= Self::MAX_FAILURES
    }
}

pub struct RpcClient {
    name: String,
    url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    next_id: AtomicU64,
    health: NodeHealth,
}

impl RpcClient {
    pub fn new(name: String, url: String, timeout: Duration) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();

        tracing::info!("Upstream: {} => {}", name, url);

        Self {
            name,
            url,
            timeout,
            client,
            next_id: AtomicU64::new(1),
            health: NodeHealth::default(),
        }
    }

    /// Make an RPC call, counting transport and node errors against this upstream.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let res = self.call_inner(method, params).await;
        match &res {
            Ok(_) => self.health.record_success(),
            Err(_) => {
                self.health.record_failure();
                metrics::inc_rpc_errors();
            }
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value> {
        let payload = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.to_string(),
            params,
        };

        let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(body)?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| anyhow!("RPC request timeout"))?
            .map_err(|e| anyhow!("RPC connection failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("RPC HTTP error: {}", status));
        }

        let body_bytes = tokio::time::timeout(self.timeout, response.into_body().collect())
            .await
            .map_err(|_| anyhow!("RPC response timeout"))??
            .to_bytes();
        let rpc_response: RpcResponse = serde_json::from_reader(body_bytes.reader())?;

        if let Some(error) = rpc_response.error {
            if !error.is_null() {
                return Err(anyhow!("RPC error: {}", error));
            }
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    /// Current work package. Nodes that omit the height from `eth_getWork`
    /// get it filled in from the pending block, best effort.
    pub async fn get_work(&self) -> Result<BlockTemplate> {
        let reply = self.call("eth_getWork", json!([])).await?;
        let mut template = BlockTemplate::from_get_work(&reply)?;
        if template.height == 0 {
            match self.pending_height().await {
                Ok(height) => template.height = height,
                Err(e) => tracing::debug!("No pending block height from {}: {}", self.name, e),
            }
        }
        Ok(template)
    }

    /// Number of the block currently being mined.
    pub async fn pending_height(&self) -> Result<u64> {
        let block = self.call("eth_getBlockByNumber", json!(["pending", false])).await?;
        parse_block_number(&block)
    }

    pub fn is_sick(&self) -> bool {
        self.health.is_sick()
    }
}

#[async_trait]
impl Upstream for RpcClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn check(&self) -> bool {
        match self.get_work().await {
            Ok(_) => !self.is_sick(),
            Err(e) => {
                tracing::warn!("Upstream {} health check failed: {}", self.name, e);
                false
            }
        }
    }

    async fn fetch_template(&self) -> Result<BlockTemplate> {
        self.get_work().await
    }

    async fn submit_work(&self, nonce: &str, header: &str, mix_digest: &str) -> Result<bool> {
        let result = self
            .call("eth_submitWork", json!([nonce, header, mix_digest]))
            .await?;
        result
            .as_bool()
            .ok_or_else(|| anyhow!("unexpected eth_submitWork reply: {}", result))
    }
}

fn parse_block_number(block: &Value) -> Result<u64> {
    let number = block
        .get("number")
        .and_then(|n| n.as_str())
        .ok_or_else(|| anyhow!("block has no number: {}", block))?;
    u64::from_str_radix(number.trim_start_matches("0x"), 16)
        .map_err(|e| anyhow!("malformed block number {}: {}", number, e))
}
