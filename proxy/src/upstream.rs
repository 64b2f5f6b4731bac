/// Upstream pool manager
///
/// Ordered list of upstream nodes (priority order == failover order) with a
/// lock-free active index. Only `check_all` moves the index.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::blockchain::BlockTemplate;
use crate::metrics::prometheus as metrics;

/// What the proxy needs from an upstream node.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn name(&self) -> &str;

    fn url(&self) -> &str;

    /// Cheap liveness/sync probe.
    async fn check(&self) -> bool;

    async fn fetch_template(&self) -> Result<BlockTemplate>;

    /// Forward a solution; `Ok(false)` means the node rejected it.
    async fn submit_work(&self, nonce: &str, header: &str, mix_digest: &str) -> Result<bool>;
}

pub struct UpstreamPool {
    upstreams: Vec<Arc<dyn Upstream>>,
    active: AtomicUsize,
}

impl UpstreamPool {
    /// `upstreams` must not be empty; config validation guarantees it.
    pub fn new(upstreams: Vec<Arc<dyn Upstream>>) -> Self {
        debug_assert!(!upstreams.is_empty());
        if let Some(first) = upstreams.first() {
            tracing::info!("Default upstream: {} => {}", first.name(), first.url());
        }
        Self { upstreams, active: AtomicUsize::new(0) }
    }

    pub fn active(&self) -> Arc<dyn Upstream> {
        let i = self.active.load(Ordering::Acquire);
        Arc::clone(&self.upstreams[i])
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Probe every upstream and activate the highest-priority healthy one.
    ///
    /// With no healthy candidate the current index is kept. Returns `true` if
    /// the active upstream changed.
    pub async fn check_all(&self) -> bool {
        let mut candidate = None;
        for (i, upstream) in self.upstreams.iter().enumerate() {
            // Probe the rest too so their own failure accounting stays current.
            if upstream.check().await && candidate.is_none() {
                candidate = Some(i);
            }
        }

        let Some(candidate) = candidate else {
            tracing::warn!("No healthy upstream found, keeping {}", self.active().name());
            return false;
        };

        let previous = self.active.swap(candidate, Ordering::AcqRel);
        if previous == candidate {
            return false;
        }

        tracing::info!(
            "Switching to {} upstream (was {})",
            self.upstreams[candidate].name(),
            self.upstreams[previous].name()
        );
        metrics::inc_upstream_switches();
        true
    }
}
