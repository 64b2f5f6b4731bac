use std::time::{Duration, Instant};

use crate::config::VarDiffSettings;

#[derive(Debug, Clone, Copy)]
pub struct VarDiffConfig {
    /// Desired average time between accepted shares.
    pub target_share_time: Duration,
    /// How often to retarget.
    pub retarget_time: Duration,
    /// Ignore small fluctuations; only retarget if deviation exceeds this fraction.
    pub variance: f64,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            target_share_time: Duration::from_secs(15),
            retarget_time: Duration::from_secs(60),
            variance: 0.3,
        }
    }
}

impl From<&VarDiffSettings> for VarDiffConfig {
    fn from(s: &VarDiffSettings) -> Self {
        Self {
            target_share_time: Duration::from_millis(s.target_share_time_ms.max(1)),
            retarget_time: Duration::from_millis(s.retarget_time_ms.max(1)),
            variance: if s.variance.is_finite() && s.variance >= 0.0 { s.variance } else { 0.0 },
        }
    }
}

/// Share-rate window of one session.
///
/// Produces an unclamped difficulty proposal; the caller clamps it through
/// the WorkDiff bounds.
#[derive(Debug, Clone)]
pub struct VarDiffState {
    cfg: VarDiffConfig,
    last_retarget: Instant,
    accepted_since: u64,
}

impl VarDiffState {
    pub fn new(cfg: VarDiffConfig) -> Self {
        Self::starting_at(cfg, Instant::now())
    }

    pub fn starting_at(cfg: VarDiffConfig, now: Instant) -> Self {
        Self { cfg, last_retarget: now, accepted_since: 0 }
    }

    /// Record a share and optionally retarget difficulty.
    ///
    /// Returns `Some(new_difficulty)` if a retarget occurred and difficulty changed.
    pub fn on_share(&mut self, now: Instant, accepted: bool, current_difficulty: i64) -> Option<i64> {
        if accepted {
            self.accepted_since = self.accepted_since.saturating_add(1);
        }

        let elapsed = now.saturating_duration_since(self.last_retarget);
        if elapsed < self.cfg.retarget_time {
            return None;
        }

        // If no accepted shares, reset window and keep current difficulty.
        if self.accepted_since == 0 {
            self.last_retarget = now;
            return None;
        }

        let elapsed_secs = elapsed.as_secs_f64().max(0.000_001);
        let avg_share_time = elapsed_secs / (self.accepted_since as f64);
        let target = self.cfg.target_share_time.as_secs_f64().max(0.000_001);

        let ratio = target / avg_share_time;
        let lower = 1.0 - self.cfg.variance;
        let upper = 1.0 + self.cfg.variance;

        self.last_retarget = now;
        self.accepted_since = 0;

        if ratio >= lower && ratio <= upper {
            return None;
        }

        let cur = current_difficulty.max(1) as f64;
        let mut next = (cur * ratio).round();
        if !next.is_finite() || next < 1.0 {
            next = 1.0;
        }
        let next = next.min(i64::MAX as f64) as i64;

        if next == current_difficulty {
            None
        } else {
            Some(next)
        }
    }
}
