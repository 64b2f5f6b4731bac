pub mod eth_proxy;
pub mod ethstratum;
pub mod protocol;
pub mod server;

pub use protocol::{Notification, StratumError, StratumRequest, StratumResponse};
pub use server::{bind, serve, Flow};
