/// Stratum message types shared by both dialects
///
/// Every frame is one JSON object per line. Requests carry `id`, `method`
/// and `params`; eth-proxy clients may add a top-level `worker`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::jobs::Job;
use crate::blockchain::target::{self, strip_0x};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    #[serde(default)]
    pub id: Value,

    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// eth-proxy worker name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl StratumRequest {
    /// Positional string parameter `i`, if present.
    pub fn str_param(&self, i: usize) -> Option<&str> {
        self.params.as_ref()?.as_array()?.get(i)?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    pub id: Value,

    /// Always present on the wire; `null` on error
    pub result: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result,
            error: None,
        }
    }

    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl StratumError {
    pub const UNKNOWN: i32 = -1;
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    pub const JOB_NOT_FOUND: i32 = 21;
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid_method(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("Method '{}' not found", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn job_not_found() -> Self {
        Self::new(Self::JOB_NOT_FOUND, "Stale share")
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "Unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(Self::NOT_SUBSCRIBED, "Not subscribed")
    }

    pub fn no_work() -> Self {
        Self::new(0, "Work not ready")
    }
}

/// Server-initiated EthereumStratum message (`id` is null).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: &str, params: Value) -> Self {
        Self { id: Value::Null, method: method.to_string(), params }
    }

    /// `mining.notify [job_id, seed, header, clean]`, hashes without `0x`.
    pub fn notify(job: &Job) -> Self {
        Self::new(
            "mining.notify",
            json!([job.job_id, strip_0x(&job.seed), strip_0x(&job.header), job.clean]),
        )
    }

    pub fn set_difficulty(difficulty: i64) -> Self {
        Self::new("mining.set_difficulty", json!([target::to_float(difficulty)]))
    }

    pub fn set_extranonce(extranonce: &str) -> Self {
        Self::new("mining.set_extranonce", json!([extranonce]))
    }
}

/// eth-proxy work push: a response with id 0 carrying `[header, seed, target]`.
pub fn work_push(job: &Job, share_target: &str) -> StratumResponse {
    StratumResponse::success(json!(0), work_result(job, share_target))
}

pub fn work_result(job: &Job, share_target: &str) -> Value {
    json!([job.header, job.seed, share_target])
}
