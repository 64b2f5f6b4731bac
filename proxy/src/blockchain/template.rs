/// Block template cache
///
/// Holds the most recently fetched work package. Templates are immutable and
/// replaced wholesale; readers get an `Arc` to a complete snapshot or nothing.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

use super::target::{self, difficulty_from_target};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTemplate {
    /// Header pow-hash, 0x-prefixed
    pub header: String,
    /// Seed hash of the current epoch, 0x-prefixed
    pub seed: String,
    /// Network boundary, 0x-prefixed
    pub target: String,
    pub height: u64,
    /// Network difficulty derived from the boundary
    pub difficulty: i64,
    pub timestamp: u64,
}

impl BlockTemplate {
    /// Parse an `eth_getWork` reply: `[header, seed, boundary, height?]`.
    pub fn from_get_work(value: &Value) -> Result<Self> {
        let reply = value
            .as_array()
            .ok_or_else(|| anyhow!("getWork reply is not an array: {}", value))?;

        let field = |i: usize| -> Result<String> {
            reply
                .get(i)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow!("getWork reply is missing field {}", i))
        };

        let header = field(0)?;
        let seed = field(1)?;
        let boundary = field(2)?;

        if !target::is_prefixed_hex(&header, 64) {
            return Err(anyhow!("malformed header hash {}", header));
        }

        let difficulty = difficulty_from_target(&boundary)
            .ok_or_else(|| anyhow!("malformed boundary {}", boundary))?;

        let height = match reply.get(3).and_then(|v| v.as_str()) {
            Some(h) => u64::from_str_radix(target::strip_0x(h), 16)
                .map_err(|e| anyhow!("malformed height {}: {}", h, e))?,
            None => 0,
        };

        Ok(Self {
            header,
            seed,
            target: boundary,
            height,
            difficulty,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
        })
    }

    /// Job id handed to clients: the first 8 bytes of the header hash.
    pub fn job_id(&self) -> String {
        job_id_for_header(&self.header)
    }
}

pub fn job_id_for_header(header: &str) -> String {
    target::strip_0x(header).chars().take(16).collect::<String>().to_lowercase()
}

/// Single-writer/multi-reader template cell.
pub struct TemplateCache {
    current: watch::Sender<Option<Arc<BlockTemplate>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    pub fn load(&self) -> Option<Arc<BlockTemplate>> {
        self.current.borrow().clone()
    }

    /// Publish a new template, returning the one it replaced.
    pub fn store(&self, template: BlockTemplate) -> Option<Arc<BlockTemplate>> {
        self.current.send_replace(Some(Arc::new(template)))
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header(c: char) -> String {
        format!("0x{}", c.to_string().repeat(64))
    }

    #[test]
    fn test_get_work_parsing() {
        let reply = json!([
            header('a'),
            header('b'),
            format!("0x00000000{}", "f".repeat(56)),
            "0x1b4"
        ]);

        let template = BlockTemplate::from_get_work(&reply).unwrap();
        assert_eq!(template.header, header('a'));
        assert_eq!(template.seed, header('b'));
        assert_eq!(template.height, 436);
        assert_eq!(template.difficulty, 4_294_967_296);
        assert_eq!(template.job_id(), "aaaaaaaaaaaaaaaa");
    }

    #[test]
    fn test_get_work_rejects_short_reply() {
        assert!(BlockTemplate::from_get_work(&json!([header('a')])).is_err());
        assert!(BlockTemplate::from_get_work(&json!({"result": 1})).is_err());
        assert!(BlockTemplate::from_get_work(&json!(["0x1234", header('b'), "0x01"])).is_err());
    }

    #[tokio::test]
    async fn test_cache_is_empty_until_first_store() {
        let cache = TemplateCache::new();
        assert!(cache.load().is_none());

        let reply = json!([header('a'), header('b'), "0xffff"]);
        let first = BlockTemplate::from_get_work(&reply).unwrap();
        assert!(cache.store(first.clone()).is_none());

        let loaded = cache.load().unwrap();
        assert_eq!(*loaded, first);

        let mut second = first.clone();
        second.header = header('c');
        let previous = cache.store(second).unwrap();
        assert_eq!(previous.header, header('a'));

        // Readers holding the old snapshot keep a complete value.
        assert_eq!(loaded.header, header('a'));
        assert_eq!(cache.load().unwrap().header, header('c'));
    }
}
