use serde::Deserialize;
use std::time::Duration;

use crate::error::ProxyError;

/// Largest extranonce we hand out; the client must keep at least two bytes of the
/// 8-byte ethash nonce for itself.
pub const MAX_NONCE_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// eth-proxy dialect (`eth_submitLogin` / `eth_getWork` / `eth_submitWork`)
    StratumProxy,
    /// NiceHash EthereumStratum/1.0.0 with extranonce subscription
    EthereumStratum,
}

impl Protocol {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Stratum-Proxy" => Some(Self::StratumProxy),
            "EthereumStratum" => Some(Self::EthereumStratum),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StratumProxy => "Stratum-Proxy",
            Self::EthereumStratum => "EthereumStratum",
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_upstream_timeout_ms() -> u64 { 10_000 }

#[derive(Deserialize, Clone, Debug)]
pub struct VarDiffSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_target_share_ms")]
    pub target_share_time_ms: u64,
    #[serde(default = "default_retarget_ms")]
    pub retarget_time_ms: u64,
    #[serde(default = "default_variance")]
    pub variance: f64,
}

impl Default for VarDiffSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_share_time_ms: default_target_share_ms(),
            retarget_time_ms: default_retarget_ms(),
            variance: default_variance(),
        }
    }
}

fn default_true() -> bool { true }
fn default_target_share_ms() -> u64 { 15_000 }
fn default_retarget_ms() -> u64 { 60_000 }
fn default_variance() -> f64 { 0.3 }

#[derive(Deserialize, Clone, Debug)]
pub struct StratumConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stratum_listen")]
    pub listen: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Idle/read timeout per connection
    #[serde(default = "default_stratum_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_min_diff_float")]
    pub min_diff_float: f64,
    #[serde(default = "default_max_diff_float")]
    pub max_diff_float: f64,
    #[serde(default = "default_nonce_size")]
    pub nonce_size: usize,
    #[serde(default)]
    pub vardiff: VarDiffSettings,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_stratum_listen(),
            protocol: default_protocol(),
            timeout_ms: default_stratum_timeout_ms(),
            min_diff_float: default_min_diff_float(),
            max_diff_float: default_max_diff_float(),
            nonce_size: default_nonce_size(),
            vardiff: VarDiffSettings::default(),
        }
    }
}

fn default_stratum_listen() -> String { "0.0.0.0:8008".to_string() }
fn default_protocol() -> String { "Stratum-Proxy".to_string() }
fn default_stratum_timeout_ms() -> u64 { 120_000 }
fn default_min_diff_float() -> f64 { 0.1 }
fn default_max_diff_float() -> f64 { 100_000.0 }
fn default_nonce_size() -> usize { 2 }

#[derive(Deserialize, Clone, Debug)]
pub struct PolicyConfig {
    /// Ban IPs that keep sending malformed requests
    #[serde(default)]
    pub banning: bool,
    #[serde(default = "default_malformed_limit")]
    pub malformed_limit: u32,
    #[serde(default = "default_ban_timeout_ms")]
    pub ban_timeout_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            banning: false,
            malformed_limit: default_malformed_limit(),
            ban_timeout_ms: default_ban_timeout_ms(),
        }
    }
}

fn default_malformed_limit() -> u32 { 5 }
fn default_ban_timeout_ms() -> u64 { 1_800_000 }

#[derive(Deserialize, Clone, Debug)]
pub struct ProxyConfig {
    /// Address of the new-work notification endpoint
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Default share difficulty (hashes) for new logins
    #[serde(default = "default_difficulty")]
    pub difficulty: i64,
    #[serde(default = "default_block_refresh_ms")]
    pub block_refresh_interval_ms: u64,
    #[serde(default = "default_clean_ms")]
    pub clean_interval_ms: u64,
    #[serde(default = "default_state_update_ms")]
    pub state_update_interval_ms: u64,
    #[serde(default)]
    pub health_check: bool,
    #[serde(default = "default_max_fails")]
    pub max_fails: i64,
    #[serde(default)]
    pub stratum: StratumConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_listen() -> String { "0.0.0.0:8888".to_string() }
fn default_difficulty() -> i64 { 2_000_000_000 }
fn default_block_refresh_ms() -> u64 { 120 }
fn default_clean_ms() -> u64 { 60_000 }
fn default_state_update_ms() -> u64 { 3_000 }
fn default_max_fails() -> i64 { 100 }

#[derive(Deserialize, Clone, Debug)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: default_redis_url(), prefix: default_redis_prefix() }
    }
}

fn default_redis_url() -> String { "redis://127.0.0.1/".to_string() }
fn default_redis_prefix() -> String { "eth".to_string() }

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// Instance name, used as the key of the persisted node state
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub upstream: Vec<UpstreamConfig>,
    #[serde(default = "default_upstream_check_ms")]
    pub upstream_check_interval_ms: u64,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

fn default_upstream_check_ms() -> u64 { 5_000 }

impl Config {
    /// Read a JSON config file and apply `PROXY_*` environment overrides.
    pub fn load(path: &str) -> Result<Self, ProxyError> {
        let txt = std::fs::read_to_string(path).map_err(|source| ProxyError::ConfigRead {
            path: path.to_string(),
            source,
        })?;
        let mut cfg = Self::from_json(&txt).map_err(|source| ProxyError::ConfigParse {
            path: path.to_string(),
            source,
        })?;
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_json(txt: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(txt)
    }

    fn apply_env(&mut self) {
        if let Ok(n) = std::env::var("PROXY_NAME") { self.name = n; }
        if let Ok(l) = std::env::var("PROXY_LISTEN") { self.proxy.listen = l; }
        if let Ok(l) = std::env::var("PROXY_STRATUM_LISTEN") { self.proxy.stratum.listen = l; }
        if let Ok(r) = std::env::var("PROXY_REDIS_URL") {
            self.redis.url = r;
        } else if let Ok(r) = std::env::var("REDIS_URL") {
            self.redis.url = r;
        }
    }

    /// Check everything that must hold before the proxy may start.
    ///
    /// Returns the selected stratum dialect. `nonce_size` below 2 is not an
    /// error, it is raised to 2 by [`Config::nonce_size`].
    pub fn validate(&self) -> Result<Protocol, ProxyError> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::MissingName);
        }
        if self.upstream.is_empty() {
            return Err(ProxyError::NoUpstreams);
        }
        for u in &self.upstream {
            // The RPC client speaks plain HTTP only.
            if !u.url.starts_with("http://") {
                return Err(ProxyError::InvalidUpstream {
                    name: u.name.clone(),
                    reason: format!("unsupported url {}", u.url),
                });
            }
        }

        let stratum = &self.proxy.stratum;
        if !stratum.enabled {
            return Err(ProxyError::StratumDisabled);
        }
        let protocol = Protocol::parse(&stratum.protocol)
            .ok_or_else(|| ProxyError::InvalidProtocol(stratum.protocol.clone()))?;

        if protocol == Protocol::EthereumStratum && stratum.min_diff_float < 0.1 {
            return Err(ProxyError::MinDiffTooLow(stratum.min_diff_float));
        }
        if stratum.min_diff_float > stratum.max_diff_float {
            return Err(ProxyError::InvalidDiffBounds {
                min: stratum.min_diff_float,
                max: stratum.max_diff_float,
            });
        }
        if stratum.nonce_size > MAX_NONCE_SIZE {
            return Err(ProxyError::NonceSizeTooLarge {
                got: stratum.nonce_size,
                max: MAX_NONCE_SIZE,
            });
        }

        Ok(protocol)
    }

    pub fn nonce_size(&self) -> usize {
        self.proxy.stratum.nonce_size.max(2)
    }

    pub fn block_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.proxy.block_refresh_interval_ms)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_millis(self.proxy.clean_interval_ms)
    }

    pub fn upstream_check_interval(&self) -> Duration {
        Duration::from_millis(self.upstream_check_interval_ms)
    }

    pub fn state_update_interval(&self) -> Duration {
        Duration::from_millis(self.proxy.state_update_interval_ms)
    }

    pub fn stratum_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.stratum.timeout_ms)
    }
}
