use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use prometheus::core::Collector;
use std::sync::OnceLock;

static SHARES: OnceLock<IntCounterVec> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();
static EXTRANONCE_ROTATIONS: OnceLock<IntCounter> = OnceLock::new();

static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_SWITCHES: OnceLock<IntCounter> = OnceLock::new();
static WORK_NOTIFICATIONS: OnceLock<IntCounter> = OnceLock::new();

static NODE_STATE_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static FAILS: OnceLock<IntGauge> = OnceLock::new();
static WORKDIFF_ENTRIES: OnceLock<IntGauge> = OnceLock::new();

fn shares() -> &'static IntCounterVec {
    SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_total", "Shares relayed upstream by result"),
            &["status"],
        ).unwrap()
    })
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| {
        IntCounter::new(
            "vardiff_retargets_total",
            "Total VarDiff retarget events",
        )
        .unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new(
            "job_broadcasts_total",
            "Total new-work broadcasts to sessions",
        )
        .unwrap()
    })
}

fn extranonce_rotations() -> &'static IntCounter {
    EXTRANONCE_ROTATIONS.get_or_init(|| {
        IntCounter::new("extranonce_rotations_total", "Total extranonce reassignments").unwrap()
    })
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("rpc_errors_total", "Total upstream RPC errors").unwrap())
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES
        .get_or_init(|| IntCounter::new("block_template_updates_total", "Total template updates").unwrap())
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        IntCounter::new(
            "block_template_fetch_errors_total",
            "Total template fetch errors",
        )
        .unwrap()
    })
}

fn upstream_switches() -> &'static IntCounter {
    UPSTREAM_SWITCHES.get_or_init(|| {
        IntCounter::new("upstream_switches_total", "Total active upstream changes").unwrap()
    })
}

fn work_notifications() -> &'static IntCounter {
    WORK_NOTIFICATIONS.get_or_init(|| {
        IntCounter::new(
            "work_notifications_total",
            "New-work notifications received on the HTTP endpoint",
        )
        .unwrap()
    })
}

fn node_state_errors() -> &'static IntCounter {
    NODE_STATE_ERRORS.get_or_init(|| {
        IntCounter::new("node_state_write_errors_total", "Failed node state writes").unwrap()
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| IntGauge::new("stratum_active_sessions", "Active Stratum sessions").unwrap())
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| IntGauge::new("block_template_height", "Current block template height").unwrap())
}

fn fails() -> &'static IntGauge {
    FAILS.get_or_init(|| IntGauge::new("proxy_consecutive_failures", "Consecutive background failures").unwrap())
}

fn workdiff_entries() -> &'static IntGauge {
    WORKDIFF_ENTRIES
        .get_or_init(|| IntGauge::new("workdiff_entries", "Tracked per-login difficulty entries").unwrap())
}

pub fn inc_share(accepted: bool) {
    let status = if accepted { "accepted" } else { "rejected" };
    shares().with_label_values(&[status]).inc();
}

pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_extranonce_rotations() {
    extranonce_rotations().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}

pub fn inc_upstream_switches() {
    upstream_switches().inc();
}

pub fn inc_work_notifications() {
    work_notifications().inc();
}

pub fn inc_node_state_errors() {
    node_state_errors().inc();
}

pub fn inc_sessions() {
    active_sessions().inc();
}

pub fn dec_sessions() {
    active_sessions().dec();
}

pub fn set_template_height(height: u64) {
    template_height().set(height.min(i64::MAX as u64) as i64);
}

pub fn set_fails(count: i64) {
    fails().set(count);
}

pub fn set_workdiff_entries(count: usize) {
    workdiff_entries().set(count as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(shares().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(extranonce_rotations().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(upstream_switches().collect());
    mfs.extend(work_notifications().collect());
    mfs.extend(node_state_errors().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(template_height().collect());
    mfs.extend(fails().collect());
    mfs.extend(workdiff_entries().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_families() {
        inc_share(true);
        inc_upstream_switches();
        set_template_height(42);

        let out = render();
        assert!(out.contains("shares_total{status=\"accepted\"}"));
        assert!(out.contains("upstream_switches_total"));
        assert!(out.contains("# TYPE block_template_height gauge"));
    }
}
