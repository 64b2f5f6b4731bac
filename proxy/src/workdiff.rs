/// Per-login work difficulty with deferred deletion
///
/// When a login disconnects its entry is not dropped right away: it is marked
/// and survives one full sweep, so a miner that reconnects quickly gets its
/// tuned difficulty back.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::blockchain::target;

/// Retention state of a WorkDiff entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// In use by a connected session
    Live,
    /// Owner disconnected since the last sweep
    Marked,
    /// Survived one sweep while marked; removed by the next one
    Expiring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkDiff {
    pub difficulty: i64,
    pub retention: Retention,
}

/// Allowed share difficulty range, in EthereumStratum float units.
#[derive(Debug, Clone, Copy)]
pub struct DiffBounds {
    pub min_float: f64,
    pub max_float: f64,
}

impl DiffBounds {
    pub fn clamp(&self, difficulty: i64) -> i64 {
        let f = target::to_float(difficulty).clamp(self.min_float, self.max_float);
        target::from_float(f)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expiring: usize,
    pub removed: usize,
}

pub struct WorkDiffs {
    bounds: DiffBounds,
    entries: RwLock<HashMap<String, WorkDiff>>,
}

impl WorkDiffs {
    pub fn new(bounds: DiffBounds) -> Self {
        tracing::info!("Set minimum float difficulty to {}", bounds.min_float);
        tracing::info!("Set maximum float difficulty to {}", bounds.max_float);
        Self { bounds, entries: RwLock::new(HashMap::new()) }
    }

    pub fn bounds(&self) -> DiffBounds {
        self.bounds
    }

    pub fn get(&self, identity: &str) -> Option<WorkDiff> {
        self.entries.read().get(identity).copied()
    }

    /// Store a clamped difficulty for `identity` and make the entry live.
    /// Returns the value actually stored.
    pub fn set(&self, identity: &str, difficulty: i64) -> i64 {
        let difficulty = self.bounds.clamp(difficulty);
        self.entries.write().insert(
            identity.to_string(),
            WorkDiff { difficulty, retention: Retention::Live },
        );
        difficulty
    }

    /// Reclaim an existing entry on reconnect.
    pub fn claim(&self, identity: &str) -> Option<i64> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(identity)?;
        entry.retention = Retention::Live;
        Some(entry.difficulty)
    }

    pub fn mark_for_deletion(&self, identity: &str) {
        if let Some(entry) = self.entries.write().get_mut(identity) {
            if entry.retention == Retention::Live {
                entry.retention = Retention::Marked;
            }
        }
    }

    /// One cleanup cycle: marked entries start expiring, expiring ones are removed.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        self.entries.write().retain(|_, entry| match entry.retention {
            Retention::Live => true,
            Retention::Marked => {
                entry.retention = Retention::Expiring;
                stats.expiring += 1;
                true
            }
            Retention::Expiring => {
                stats.removed += 1;
                false
            }
        });

        if stats.removed > 0 {
            tracing::debug!("Removed {} stale difficulty entries", stats.removed);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diffs() -> WorkDiffs {
        WorkDiffs::new(DiffBounds { min_float: 0.1, max_float: 10.0 })
    }

    #[test]
    fn set_clamps_into_bounds() {
        let wd = diffs();
        let low = wd.set("low", 1);
        assert_eq!(low, target::from_float(0.1));

        let high = wd.set("high", i64::MAX);
        assert_eq!(high, target::from_float(10.0));

        let mid = target::from_float(2.5);
        assert_eq!(wd.set("mid", mid), mid);
        assert_eq!(wd.get("mid").unwrap().retention, Retention::Live);
    }

    #[test]
    fn clamped_values_stay_in_range() {
        let wd = diffs();
        for d in [0, 1, 1_000, 429_496_730, 4_294_967_296, 50_000_000_000, i64::MAX] {
            let f = target::to_float(wd.set("x", d));
            assert!(f >= 0.1 - 1e-9 && f <= 10.0 + 1e-9, "{} -> {}", d, f);
        }
    }

    #[test]
    fn marked_entry_survives_one_sweep() {
        let wd = diffs();
        wd.set("miner", target::from_float(1.0));
        wd.mark_for_deletion("miner");

        assert_eq!(wd.sweep(), SweepStats { expiring: 1, removed: 0 });
        assert_eq!(wd.get("miner").unwrap().retention, Retention::Expiring);

        assert_eq!(wd.sweep(), SweepStats { expiring: 0, removed: 1 });
        assert!(wd.get("miner").is_none());
    }

    #[test]
    fn reclaim_before_second_sweep_keeps_difficulty() {
        let wd = diffs();
        let tuned = wd.set("miner", target::from_float(3.0));
        wd.mark_for_deletion("miner");
        wd.sweep();

        assert_eq!(wd.claim("miner"), Some(tuned));
        wd.sweep();
        wd.sweep();
        assert_eq!(wd.get("miner").unwrap().difficulty, tuned);
        assert_eq!(wd.get("miner").unwrap().retention, Retention::Live);
    }

    #[test]
    fn live_entries_are_never_swept() {
        let wd = diffs();
        wd.set("a", 1);
        for _ in 0..5 {
            wd.sweep();
        }
        assert_eq!(wd.len(), 1);
        assert!(wd.claim("missing").is_none());
    }

    #[test]
    fn marking_an_expiring_entry_does_not_extend_it() {
        let wd = diffs();
        wd.set("a", 1);
        wd.mark_for_deletion("a");
        wd.sweep();
        wd.mark_for_deletion("a");
        wd.sweep();
        assert!(wd.is_empty());
    }
}
