/// Proxy coordinator
///
/// `ProxyServer` is the one shared context of a running proxy. Each resource
/// it owns carries its own guard (atomic index, template cell, session map,
/// difficulty map, job queue), so none of them serializes the others.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

use crate::blockchain::target::{self, target_from_difficulty};
use crate::blockchain::{BlockTemplate, RpcClient, TemplateCache};
use crate::config::{Config, Protocol};
use crate::error::ProxyError;
use crate::jobs::{Job, JobHistory, JobQueue, JobUpdate};
use crate::metrics::prometheus as metrics;
use crate::policy::{AccessPolicy, AllowAll, MalformedBan};
use crate::scheduler::{PeriodicTask, Scheduler};
use crate::session::{ExtranonceAllocator, Session, SessionRegistry, SessionWriter, Stage};
use crate::storage::{NodeStateStore, RedisBackend};
use crate::notify;
use crate::stratum::{self, protocol::{work_push, Notification}};
use crate::upstream::{Upstream, UpstreamPool};
use crate::vardiff::{VarDiffConfig, VarDiffState};
use crate::workdiff::{DiffBounds, SweepStats, WorkDiffs};

/// Upper bound for a single outbound frame to a miner.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub upstream: String,
    pub height: Option<u64>,
    pub sessions: usize,
    pub fails: i64,
}

pub struct ProxyServer {
    config: Config,
    protocol: Protocol,
    upstreams: UpstreamPool,
    templates: TemplateCache,
    sessions: SessionRegistry,
    work_diffs: WorkDiffs,
    jobs: JobQueue,
    history: JobHistory,
    extranonces: ExtranonceAllocator,
    fails: AtomicI64,
    backend: Arc<dyn NodeStateStore>,
    policy: Arc<dyn AccessPolicy>,
    vardiff: Option<VarDiffConfig>,
}

impl ProxyServer {
    /// Validate `config` and assemble a server around the given collaborators.
    pub fn new(
        config: Config,
        upstreams: Vec<Arc<dyn Upstream>>,
        backend: Arc<dyn NodeStateStore>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Result<Arc<Self>, ProxyError> {
        let protocol = config.validate()?;
        if upstreams.is_empty() {
            return Err(ProxyError::NoUpstreams);
        }

        let stratum = &config.proxy.stratum;
        let work_diffs = WorkDiffs::new(DiffBounds {
            min_float: stratum.min_diff_float,
            max_float: stratum.max_diff_float,
        });

        let nonce_size = config.nonce_size();
        tracing::info!("Set nonce size to {}", nonce_size);

        let vardiff = stratum
            .vardiff
            .enabled
            .then(|| VarDiffConfig::from(&stratum.vardiff));

        Ok(Arc::new(Self {
            protocol,
            upstreams: UpstreamPool::new(upstreams),
            templates: TemplateCache::new(),
            sessions: SessionRegistry::new(),
            work_diffs,
            jobs: JobQueue::new(),
            history: JobHistory::default(),
            extranonces: ExtranonceAllocator::new(nonce_size),
            fails: AtomicI64::new(0),
            backend,
            policy,
            vardiff,
            config,
        }))
    }

    /// Build the production collaborators (JSON-RPC upstreams, Redis) from `config`.
    pub fn from_config(config: Config) -> Result<Arc<Self>, ProxyError> {
        config.validate()?;

        let upstreams: Vec<Arc<dyn Upstream>> = config
            .upstream
            .iter()
            .map(|u| {
                Arc::new(RpcClient::new(u.name.clone(), u.url.clone(), u.timeout())) as Arc<dyn Upstream>
            })
            .collect();

        let backend = RedisBackend::new(&config.redis.url, &config.redis.prefix)
            .map_err(ProxyError::Backend)?;

        let policy: Arc<dyn AccessPolicy> = if config.proxy.policy.banning {
            Arc::new(MalformedBan::from_config(&config.proxy.policy))
        } else {
            Arc::new(AllowAll)
        };

        Self::new(config, upstreams, Arc::new(backend), policy)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn upstreams(&self) -> &UpstreamPool {
        &self.upstreams
    }

    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    pub fn current_template(&self) -> Option<Arc<BlockTemplate>> {
        self.templates.load()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn work_diffs(&self) -> &WorkDiffs {
        &self.work_diffs
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn history(&self) -> &JobHistory {
        &self.history
    }

    pub fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }

    pub fn nonce_size(&self) -> usize {
        self.extranonces.size()
    }

    // ── Failure accounting ─────────────────────────────────────────

    pub fn mark_sick(&self) {
        let fails = self.fails.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_fails(fails);
    }

    pub fn mark_ok(&self) {
        self.fails.store(0, Ordering::Release);
        metrics::set_fails(0);
    }

    pub fn fails(&self) -> i64 {
        self.fails.load(Ordering::Acquire)
    }

    pub fn is_sick(&self) -> bool {
        self.config.proxy.health_check && self.fails() >= self.config.proxy.max_fails
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: if self.is_sick() { "sick" } else { "ok" },
            upstream: self.upstreams.active().name().to_string(),
            height: self.templates.load().map(|t| t.height),
            sessions: self.sessions.len(),
            fails: self.fails(),
        }
    }

    // ── Background cycles ──────────────────────────────────────────

    /// Fetch work from the active upstream. Broadcasts when the header changed.
    ///
    /// On failure the cached template stays in place. Returns whether the
    /// fetch succeeded.
    pub async fn refresh_template(&self) -> bool {
        let upstream = self.upstreams.active();
        let template = match upstream.fetch_template().await {
            Ok(t) => t,
            Err(e) => {
                self.mark_sick();
                metrics::inc_template_fetch_errors();
                tracing::error!("Error while refreshing block template on {}: {}", upstream.name(), e);
                return false;
            }
        };
        self.mark_ok();

        let changed = match self.templates.load() {
            Some(current) => current.header != template.header,
            None => true,
        };
        if !changed {
            return true;
        }

        tracing::info!(
            "New block to mine on {} at height {} / {}",
            upstream.name(),
            template.height,
            template.header
        );
        metrics::set_template_height(template.height);
        metrics::inc_template_updates();

        let job = Arc::new(Job::from_template(&template));
        self.templates.store(template);
        self.broadcast_new_work(job).await;
        true
    }

    /// Health sweep over all upstreams. A switch hands subscribed
    /// EthereumStratum sessions a fresh extranonce and forces an immediate
    /// refresh.
    pub async fn check_upstreams(&self) {
        if !self.upstreams.check_all().await {
            return;
        }
        if self.protocol == Protocol::EthereumStratum {
            for session in self.sessions.snapshot() {
                if session.exn_sub() {
                    self.rotate_extranonce(&session).await;
                }
            }
        }
        self.refresh_template().await;
    }

    /// Persist height and difficulty of the current template.
    pub async fn write_state(&self) {
        let Some(t) = self.templates.load() else {
            return;
        };
        match self.backend.write_node_state(&self.config.name, t.height, t.difficulty).await {
            Ok(()) => self.mark_ok(),
            Err(e) => {
                tracing::error!("Failed to write node state to backend: {}", e);
                metrics::inc_node_state_errors();
                self.mark_sick();
            }
        }
    }

    pub fn sweep_work_diffs(&self) -> SweepStats {
        let stats = self.work_diffs.sweep();
        metrics::set_workdiff_entries(self.work_diffs.len());
        stats
    }

    /// Start the refresh, clean, check and state loops.
    pub fn spawn_scheduler(self: &Arc<Self>) -> Scheduler {
        let refresh = {
            let server = Arc::clone(self);
            PeriodicTask::spawn("block refresh", self.config.block_refresh_interval(), move || {
                let server = Arc::clone(&server);
                async move {
                    server.refresh_template().await;
                }
            })
        };

        let clean = {
            let server = Arc::clone(self);
            PeriodicTask::spawn("difficulty cleanup", self.config.clean_interval(), move || {
                let server = Arc::clone(&server);
                async move {
                    server.sweep_work_diffs();
                    server.policy.purge();
                }
            })
        };

        let check = {
            let server = Arc::clone(self);
            PeriodicTask::spawn("upstream check", self.config.upstream_check_interval(), move || {
                let server = Arc::clone(&server);
                async move {
                    server.check_upstreams().await;
                }
            })
        };

        let state = {
            let server = Arc::clone(self);
            PeriodicTask::spawn("state update", self.config.state_update_interval(), move || {
                let server = Arc::clone(&server);
                async move {
                    server.write_state().await;
                }
            })
        };

        Scheduler { tasks: vec![refresh, clean, check, state] }
    }

    /// Fetch initial work, bind both listeners and start the background
    /// loops. Returns only when the work listener stops.
    pub async fn start(self: Arc<Self>) -> Result<(), ProxyError> {
        self.refresh_template().await;

        let stratum_addr = self.config.proxy.stratum.listen.clone();
        let stratum_listener = stratum::bind(&stratum_addr)
            .map_err(|source| ProxyError::Bind { addr: stratum_addr, source })?;

        let listen = self.config.proxy.listen.clone();
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|source| ProxyError::Bind { addr: listen.clone(), source })?;

        let scheduler = self.spawn_scheduler();
        tokio::spawn(stratum::serve(Arc::clone(&self), stratum_listener));

        let result = notify::serve(listener, Arc::clone(&self)).await;
        scheduler.abort_all();
        result.map_err(|source| ProxyError::Serve { addr: listen, source })
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Create and register a session for a freshly accepted connection.
    pub fn open_session(&self, ip: String, writer: SessionWriter) -> Arc<Session> {
        let session = Arc::new(Session::new(
            uuid::Uuid::new_v4().to_string(),
            ip,
            writer,
            self.extranonces.next(),
            WRITE_TIMEOUT,
        ));
        self.sessions.add(Arc::clone(&session));
        session
    }

    /// Unregister a session; its difficulty entry is kept for one more sweep.
    pub fn close_session(&self, session: &Session) {
        if self.sessions.remove(&session.id).is_none() {
            return;
        }
        if let Some(login) = session.login() {
            self.work_diffs.mark_for_deletion(&login);
        }
    }

    /// Difficulty for a login that just authorized: the retained entry,
    /// else a `d=` password hint, else the configured default. Always clamped
    /// and recorded live.
    pub fn initial_difficulty(&self, login: &str, pass: Option<&str>) -> i64 {
        let difficulty = self
            .work_diffs
            .claim(login)
            .or_else(|| pass.and_then(parse_difficulty_hint).map(target::from_float))
            .unwrap_or(self.config.proxy.difficulty);
        self.work_diffs.set(login, difficulty)
    }

    /// Bind a login to the session. `false` when the policy refuses it.
    pub fn authorize(&self, session: &Session, login: &str, worker: Option<String>, pass: Option<&str>) -> bool {
        if !self.policy.apply_login_policy(login, &session.ip) {
            tracing::warn!("Login {} from {} refused by policy", login, session.ip);
            return false;
        }

        let difficulty = self.initial_difficulty(login, pass);
        let vardiff = self.vardiff.map(VarDiffState::new);
        session.with_state(|st| {
            st.stage = Stage::Authorized;
            st.login = Some(login.to_string());
            st.worker = worker;
            st.difficulty = difficulty;
            st.vardiff = vardiff;
        });
        metrics::set_workdiff_entries(self.work_diffs.len());

        tracing::info!(
            "Authorized {} from {} at difficulty {}",
            login,
            session.ip,
            target::to_float(difficulty)
        );
        true
    }

    /// Forward a solution to the active upstream and account for it.
    pub async fn submit(&self, session: &Arc<Session>, nonce: &str, header: &str, mix_digest: &str) -> Result<bool> {
        let upstream = self.upstreams.active();
        let accepted = upstream.submit_work(nonce, header, mix_digest).await?;

        metrics::inc_share(accepted);
        if accepted {
            tracing::debug!("Share from {}@{} accepted by {}", session.login().unwrap_or_default(), session.ip, upstream.name());
        } else {
            tracing::info!("Share from {}@{} rejected by {}", session.login().unwrap_or_default(), session.ip, upstream.name());
        }

        Ok(accepted)
    }

    /// Feed a share result into the session's vardiff window, retargeting
    /// when it asks for it. Call after the submit reply went out.
    pub async fn record_share(&self, session: &Arc<Session>, accepted: bool) {
        if let Some(proposed) = session.record_share(accepted, Instant::now()) {
            self.retarget(session, proposed).await;
        }
    }

    /// Move a session to a new difficulty and notify it.
    pub async fn retarget(&self, session: &Arc<Session>, proposed: i64) {
        let clamped = match session.login() {
            Some(login) => self.work_diffs.set(&login, proposed),
            None => self.work_diffs.bounds().clamp(proposed),
        };
        if clamped == session.difficulty() {
            return;
        }

        session.set_difficulty(clamped);
        metrics::inc_vardiff_retarget();
        tracing::debug!("Retarget {} to {}", session.id, target::to_float(clamped));

        self.jobs.push(&session.id, JobUpdate::Retarget { difficulty: clamped });
        // Only this session's slot; other sessions are served by the broadcast path.
        if let Some(update) = self.jobs.take(&session.id) {
            if let Err(e) = self.deliver(session, update).await {
                tracing::warn!("Failed to deliver retarget to {}: {}", session.ip, e);
            }
        }
    }

    /// Hand the session a new extranonce, notifying it if it opted in.
    pub async fn rotate_extranonce(&self, session: &Session) -> String {
        let extranonce = self.extranonces.next();
        session.with_state(|st| st.extranonce = extranonce.clone());
        metrics::inc_extranonce_rotations();

        if session.exn_sub() {
            if let Err(e) = session.send(&Notification::set_extranonce(&extranonce)).await {
                tracing::warn!("Failed to send extranonce to {}: {}", session.ip, e);
            }
        }
        extranonce
    }

    // ── Work distribution ──────────────────────────────────────────

    /// Queue `job` for every authorized session and deliver the queue.
    pub async fn broadcast_new_work(&self, job: Arc<Job>) {
        self.history.insert(Arc::clone(&job));

        let sessions = self.sessions.snapshot();
        let mut queued = 0;
        for session in &sessions {
            if session.is_authorized() {
                self.jobs.push(&session.id, JobUpdate::new_work(Arc::clone(&job)));
                queued += 1;
            }
        }
        if queued > 0 {
            tracing::debug!("Broadcasting job {} to {} sessions", job.job_id, queued);
            metrics::inc_job_broadcasts();
        }

        self.flush_jobs().await;
    }

    /// Drain the job queue, writing each update to its session.
    pub async fn flush_jobs(&self) {
        for (session_id, update) in self.jobs.drain() {
            let Some(session) = self.sessions.get(&session_id) else {
                continue;
            };
            if let Err(e) = self.deliver(&session, update).await {
                tracing::warn!("Failed to deliver work to {}: {}", session.ip, e);
            }
        }
    }

    /// Current job, marked so clients keep working on what they have.
    fn current_job(&self) -> Option<Job> {
        self.templates.load().map(|t| Job { clean: false, ..Job::from_template(&t) })
    }

    async fn deliver(&self, session: &Session, update: JobUpdate) -> Result<()> {
        match update {
            JobUpdate::NewWork { job, difficulty } => {
                if let (Some(difficulty), Protocol::EthereumStratum) = (difficulty, self.protocol) {
                    session.send(&Notification::set_difficulty(difficulty)).await?;
                }
                self.send_job(session, &job).await
            }
            JobUpdate::Retarget { difficulty } => {
                if self.protocol == Protocol::EthereumStratum {
                    session.send(&Notification::set_difficulty(difficulty)).await?;
                }
                match self.current_job() {
                    Some(job) => self.send_job(session, &job).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Send one job in the session's dialect.
    pub async fn send_job(&self, session: &Session, job: &Job) -> Result<()> {
        session.with_state(|st| st.current_job_id = Some(job.job_id.clone()));
        match self.protocol {
            Protocol::StratumProxy => {
                let share_target = target_from_difficulty(session.difficulty());
                session.send(&work_push(job, &share_target)).await
            }
            Protocol::EthereumStratum => session.send(&Notification::notify(job)).await,
        }
    }
}

/// `d=<float>` difficulty hint in a password such as `x,d=2.5`.
pub fn parse_difficulty_hint(pass: &str) -> Option<f64> {
    pass.split(|c| c == ',' || c == ';' || c == ' ')
        .filter_map(|part| part.trim().strip_prefix("d="))
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .find(|d| d.is_finite() && *d > 0.0)
}
