/// Connection admission policy
///
/// The listeners consult an `AccessPolicy` on connect, on login and on every
/// malformed request. `AllowAll` admits everything; `MalformedBan` puts an IP
/// on a temporary ban list after repeated protocol violations.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::PolicyConfig;

pub trait AccessPolicy: Send + Sync {
    fn is_banned(&self, ip: &str) -> bool;

    /// `false` rejects the login and closes the session.
    fn apply_login_policy(&self, login: &str, ip: &str) -> bool;

    /// Record a malformed request. `false` means the IP is now banned.
    fn apply_malformed_policy(&self, ip: &str) -> bool;

    /// Drop expired state. Called from the cleanup timer.
    fn purge(&self) {}
}

pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_banned(&self, _ip: &str) -> bool {
        false
    }

    fn apply_login_policy(&self, _login: &str, _ip: &str) -> bool {
        true
    }

    fn apply_malformed_policy(&self, _ip: &str) -> bool {
        true
    }
}

#[derive(Default)]
struct Strikes {
    /// IP -> (malformed requests since last ban, last strike)
    malformed: HashMap<String, (u32, Instant)>,
    /// IP -> ban expiry
    banned: HashMap<String, Instant>,
}

/// Temporary ban after `limit` malformed requests from one IP.
pub struct MalformedBan {
    limit: u32,
    ban_timeout: Duration,
    strikes: Mutex<Strikes>,
}

impl MalformedBan {
    pub fn new(limit: u32, ban_timeout: Duration) -> Self {
        Self { limit: limit.max(1), ban_timeout, strikes: Mutex::new(Strikes::default()) }
    }

    pub fn from_config(cfg: &PolicyConfig) -> Self {
        Self::new(cfg.malformed_limit, Duration::from_millis(cfg.ban_timeout_ms))
    }

    fn banned_at(&self, ip: &str, now: Instant) -> bool {
        let mut strikes = self.strikes.lock();
        match strikes.banned.get(ip) {
            Some(&expiry) if now < expiry => true,
            Some(_) => {
                strikes.banned.remove(ip);
                false
            }
            None => false,
        }
    }

    fn strike_at(&self, ip: &str, now: Instant) -> bool {
        let mut strikes = self.strikes.lock();
        let (count, last) = strikes.malformed.entry(ip.to_string()).or_insert((0, now));
        *count += 1;
        *last = now;
        if *count < self.limit {
            return true;
        }

        strikes.malformed.remove(ip);
        strikes.banned.insert(ip.to_string(), now + self.ban_timeout);
        tracing::warn!("Banned {} for {:?} after {} malformed requests", ip, self.ban_timeout, self.limit);
        false
    }

    /// Forget expired bans and strikes older than one ban period.
    fn purge_at(&self, now: Instant) {
        let mut strikes = self.strikes.lock();
        strikes.banned.retain(|_, expiry| now < *expiry);
        let window = self.ban_timeout;
        strikes
            .malformed
            .retain(|_, (_, last)| now.saturating_duration_since(*last) < window);
    }
}

impl AccessPolicy for MalformedBan {
    fn is_banned(&self, ip: &str) -> bool {
        self.banned_at(ip, Instant::now())
    }

    fn apply_login_policy(&self, _login: &str, ip: &str) -> bool {
        !self.is_banned(ip)
    }

    fn apply_malformed_policy(&self, ip: &str) -> bool {
        self.strike_at(ip, Instant::now())
    }

    fn purge(&self) {
        self.purge_at(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_admits_everything() {
        let p = AllowAll;
        assert!(!p.is_banned("1.2.3.4"));
        assert!(p.apply_login_policy("0xabc", "1.2.3.4"));
        assert!(p.apply_malformed_policy("1.2.3.4"));
    }

    #[test]
    fn ban_after_limit_then_expire() {
        let p = MalformedBan::new(3, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(p.strike_at("10.0.0.1", t0));
        assert!(p.strike_at("10.0.0.1", t0));
        assert!(!p.strike_at("10.0.0.1", t0));

        assert!(p.banned_at("10.0.0.1", t0 + Duration::from_secs(59)));
        assert!(!p.banned_at("10.0.0.2", t0));
        assert!(!p.banned_at("10.0.0.1", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn purge_drops_stale_strikes_and_expired_bans() {
        let p = MalformedBan::new(2, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(p.strike_at("10.0.0.1", t0));
        assert!(p.strike_at("10.0.0.2", t0));
        assert!(!p.strike_at("10.0.0.2", t0));
        assert!(p.strike_at("10.0.0.3", t0 + Duration::from_secs(50)));

        p.purge_at(t0 + Duration::from_secs(61));
        {
            let strikes = p.strikes.lock();
            assert!(strikes.banned.is_empty());
            assert_eq!(strikes.malformed.len(), 1);
            assert!(strikes.malformed.contains_key("10.0.0.3"));
        }

        // The old strike is gone, so one more does not ban.
        assert!(p.strike_at("10.0.0.1", t0 + Duration::from_secs(62)));
    }
}
