/// Node state persistence
///
/// The proxy only ever writes one thing to the backend: the height and
/// network difficulty of the current template, keyed by instance name.
/// Uses redis::aio::ConnectionManager, opened lazily on first write.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait NodeStateStore: Send + Sync {
    async fn write_node_state(&self, name: &str, height: u64, difficulty: i64) -> Result<()>;
}

pub struct RedisBackend {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
    prefix: String,
}

impl RedisBackend {
    pub fn new(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            prefix: prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut conn_guard = self.connection.write().await;

        if let Some(conn) = conn_guard.as_ref() {
            return Ok(conn.clone());
        }

        let manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
        *conn_guard = Some(manager.clone());
        Ok(manager)
    }

    fn nodes_key(&self) -> String {
        format!("{}:nodes", self.prefix)
    }
}

/// Hash fields written for one node state update.
fn node_fields(name: &str, height: u64, difficulty: i64, now: i64) -> [(String, String); 4] {
    [
        (format!("{}:name", name), name.to_string()),
        (format!("{}:height", name), height.to_string()),
        (format!("{}:difficulty", name), difficulty.to_string()),
        (format!("{}:lastBeat", name), now.to_string()),
    ]
}

#[async_trait]
impl NodeStateStore for RedisBackend {
    async fn write_node_state(&self, name: &str, height: u64, difficulty: i64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let key = self.nodes_key();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, value) in node_fields(name, height, difficulty, chrono::Utc::now().timestamp()) {
            pipe.hset(&key, field, value).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to write node state: {}", e))?;

        Ok(())
    }
}
