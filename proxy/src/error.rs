use thiserror::Error;

/// Startup failures. Every variant aborts the process; nothing here is retried.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("you must set instance name")]
    MissingName,

    #[error("at least one upstream must be configured")]
    NoUpstreams,

    #[error("stratum endpoint is not configured properly")]
    StratumDisabled,

    #[error("please choose either Stratum-Proxy or EthereumStratum protocol for your stratum endpoint, got {0:?}")]
    InvalidProtocol(String),

    #[error("for EthereumStratum protocol type, the minimum float difficulty must be set to at least 0.1 (got {0})")]
    MinDiffTooLow(f64),

    #[error("minimum float difficulty {min} is greater than maximum {max}")]
    InvalidDiffBounds { min: f64, max: f64 },

    #[error("nonce size must be at most {max} bytes (got {got})")]
    NonceSizeTooLarge { got: usize, max: usize },

    #[error("invalid upstream {name}: {reason}")]
    InvalidUpstream { name: String, reason: String },

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener on {addr} failed: {source}")]
    Serve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend: {0}")]
    Backend(#[source] anyhow::Error),
}
