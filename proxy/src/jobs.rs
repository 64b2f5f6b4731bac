/// Outstanding work for connected sessions
///
/// `JobQueue` holds at most one pending notification per session; a newer
/// update replaces an unconsumed older one. `JobHistory` remembers recently
/// issued jobs so submissions can be matched back to a header hash.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::blockchain::BlockTemplate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    pub header: String,
    pub seed: String,
    pub height: u64,
    /// Clients should drop older work
    pub clean: bool,
}

impl Job {
    pub fn from_template(template: &BlockTemplate) -> Self {
        Self {
            job_id: template.job_id(),
            header: template.header.clone(),
            seed: template.seed.clone(),
            height: template.height,
            clean: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// Template changed: send the new job, preceded by a difficulty change
    /// that was still pending for the session
    NewWork { job: Arc<Job>, difficulty: Option<i64> },
    /// Only the session's difficulty changed
    Retarget { difficulty: i64 },
}

impl JobUpdate {
    pub fn new_work(job: Arc<Job>) -> Self {
        Self::NewWork { job, difficulty: None }
    }

    pub fn difficulty(&self) -> Option<i64> {
        match self {
            Self::NewWork { difficulty, .. } => *difficulty,
            Self::Retarget { difficulty } => Some(*difficulty),
        }
    }

    /// Fold a newer update into this pending one. The newest job and the
    /// newest difficulty both survive.
    fn merge(self, newer: JobUpdate) -> JobUpdate {
        match (self, newer) {
            (Self::NewWork { job, .. }, Self::Retarget { difficulty }) => {
                Self::NewWork { job, difficulty: Some(difficulty) }
            }
            (older, Self::NewWork { job, difficulty }) => {
                Self::NewWork { job, difficulty: difficulty.or(older.difficulty()) }
            }
            (Self::Retarget { .. }, newer @ Self::Retarget { .. }) => newer,
        }
    }
}

#[derive(Default)]
struct Pending {
    order: VecDeque<String>,
    updates: HashMap<String, JobUpdate>,
}

#[derive(Default)]
pub struct JobQueue {
    pending: Mutex<Pending>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an update for `session_id`, merging it into a pending one.
    pub fn push(&self, session_id: &str, update: JobUpdate) {
        let mut pending = self.pending.lock();
        match pending.updates.remove(session_id) {
            Some(older) => {
                pending.updates.insert(session_id.to_string(), older.merge(update));
            }
            None => {
                pending.updates.insert(session_id.to_string(), update);
                pending.order.push_back(session_id.to_string());
            }
        }
    }

    /// Take the pending update of one session, leaving the others queued.
    pub fn take(&self, session_id: &str) -> Option<JobUpdate> {
        let mut pending = self.pending.lock();
        let update = pending.updates.remove(session_id)?;
        pending.order.retain(|id| id != session_id);
        Some(update)
    }

    /// Take every pending update in first-queued order.
    pub fn drain(&self) -> Vec<(String, JobUpdate)> {
        let mut pending = self.pending.lock();
        let Pending { order, updates } = &mut *pending;
        order
            .drain(..)
            .filter_map(|id| updates.remove(&id).map(|u| (id, u)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct History {
    jobs: HashMap<String, Arc<Job>>,
    order: VecDeque<String>,
}

pub struct JobHistory {
    limit: usize,
    inner: Mutex<History>,
}

impl JobHistory {
    pub const DEFAULT_LIMIT: usize = 256;

    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1), inner: Mutex::new(History::default()) }
    }

    pub fn insert(&self, job: Arc<Job>) {
        let mut h = self.inner.lock();
        let id = job.job_id.clone();
        h.order.retain(|j| j != &id);
        h.order.push_back(id.clone());
        h.jobs.insert(id, job);

        while h.order.len() > self.limit {
            if let Some(oldest) = h.order.pop_front() {
                h.jobs.remove(&oldest);
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        self.inner.lock().jobs.get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobHistory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT)
    }
}
