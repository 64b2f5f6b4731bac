pub mod blockchain;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod policy;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;
pub mod stratum;
pub mod upstream;
pub mod vardiff;
pub mod workdiff;

pub use config::{Config, Protocol};
pub use error::ProxyError;
pub use server::ProxyServer;
