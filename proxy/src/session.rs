/// Connected miner sessions
///
/// A `Session` owns the write half of its socket behind a private async lock.
/// Every outbound frame is written while holding that lock, so broadcasts and
/// replies to the session's own requests never interleave on the wire.
/// `SessionRegistry` is the set of live sessions; broadcasters take a
/// snapshot and release the registry lock before doing any I/O.

use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::metrics::prometheus as metrics;
use crate::vardiff::VarDiffState;

pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Initial state after connection
    Connected,
    /// After `mining.subscribe`
    Subscribed,
    /// After login/authorize
    Authorized,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub stage: Stage,
    /// Login identity; keys the WorkDiff map
    pub login: Option<String>,
    pub worker: Option<String>,
    pub extranonce: String,
    pub difficulty: i64,
    pub current_job_id: Option<String>,
    pub shares_submitted: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub vardiff: Option<VarDiffState>,
}

pub struct Session {
    pub id: String,
    pub ip: String,
    writer: tokio::sync::Mutex<SessionWriter>,
    write_timeout: Duration,
    exn_sub: AtomicBool,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        id: String,
        ip: String,
        writer: SessionWriter,
        extranonce: String,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            ip,
            writer: tokio::sync::Mutex::new(writer),
            write_timeout,
            exn_sub: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                stage: Stage::Connected,
                login: None,
                worker: None,
                extranonce,
                difficulty: 0,
                current_job_id: None,
                shares_submitted: 0,
                shares_accepted: 0,
                shares_rejected: 0,
                vardiff: None,
            }),
        }
    }

    /// Write one JSON message followed by `\n`.
    ///
    /// The writer lock is held for the whole frame and released on every
    /// exit path, including the timeout.
    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<()> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        tokio::time::timeout(self.write_timeout, async {
            writer.write_all(&line).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| anyhow!("write timeout to {}", self.ip))??;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Run `f` with the mutable session state. Never hold this across an await.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn login(&self) -> Option<String> {
        self.state.lock().login.clone()
    }

    pub fn stage(&self) -> Stage {
        self.state.lock().stage
    }

    pub fn is_authorized(&self) -> bool {
        self.stage() == Stage::Authorized
    }

    pub fn extranonce(&self) -> String {
        self.state.lock().extranonce.clone()
    }

    pub fn difficulty(&self) -> i64 {
        self.state.lock().difficulty
    }

    pub fn set_difficulty(&self, difficulty: i64) {
        self.state.lock().difficulty = difficulty;
    }

    pub fn subscribe_extranonce(&self) {
        self.exn_sub.store(true, Ordering::Release);
    }

    pub fn exn_sub(&self) -> bool {
        self.exn_sub.load(Ordering::Acquire)
    }

    /// Count a relayed share and feed the vardiff window.
    ///
    /// Returns a new (unclamped) difficulty when vardiff wants a retarget.
    pub fn record_share(&self, accepted: bool, now: Instant) -> Option<i64> {
        let mut st = self.state.lock();
        st.shares_submitted += 1;
        if accepted {
            st.shares_accepted += 1;
        } else {
            st.shares_rejected += 1;
        }
        let current = st.difficulty;
        st.vardiff.as_mut()?.on_share(now, accepted, current)
    }
}

/// Hands out per-session nonce prefixes of `size` bytes.
pub struct ExtranonceAllocator {
    size: usize,
    next: AtomicU64,
}

impl ExtranonceAllocator {
    pub fn new(size: usize) -> Self {
        Self { size: size.clamp(1, 7), next: AtomicU64::new(0) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Next extranonce as `2 * size` lowercase hex digits. Wraps around once
    /// the space is exhausted.
    pub fn next(&self) -> String {
        let space = 1u64 << (8 * self.size as u32);
        let value = self.next.fetch_add(1, Ordering::Relaxed) % space;
        format!("{:0width$x}", value, width = self.size * 2)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        if self.sessions.write().insert(session.id.clone(), session).is_none() {
            metrics::inc_sessions();
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(session_id);
        if removed.is_some() {
            metrics::dec_sessions();
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Point-in-time copy of the live sessions.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
