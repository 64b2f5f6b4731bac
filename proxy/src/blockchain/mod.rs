/// Upstream node communication and work templates

pub mod rpc_client;
pub mod target;
pub mod template;

pub use rpc_client::RpcClient;
pub use template::{BlockTemplate, TemplateCache};
