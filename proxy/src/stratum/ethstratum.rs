/// EthereumStratum/1.0.0 (NiceHash) dialect
///
/// Handshake is `mining.subscribe` -> optional `mining.extranonce.subscribe`
/// -> `mining.authorize`. The server owns the first `nonce_size` bytes of the
/// 8-byte nonce (the extranonce); miners submit only the remainder.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;

use super::protocol::{Notification, StratumError, StratumRequest, StratumResponse};
use super::server::{malformed, unknown_method, Flow};
use crate::blockchain::target::is_hex;
use crate::jobs::Job;
use crate::server::ProxyServer;
use crate::session::{Session, Stage};

pub const PROTOCOL_VERSION: &str = "EthereumStratum/1.0.0";

/// ethash nonces are 8 bytes.
const NONCE_HEX_LEN: usize = 16;

/// ES does not carry the mix digest; the upstream recomputes it.
const ZERO_MIX_DIGEST: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

pub async fn handle(server: &ProxyServer, session: &Arc<Session>, req: StratumRequest) -> Result<Flow> {
    match req.method.as_str() {
        "mining.subscribe" => handle_subscribe(session, req).await,
        "mining.extranonce.subscribe" => {
            session.subscribe_extranonce();
            reply(session, req.id, json!(true)).await
        }
        "mining.authorize" => handle_authorize(server, session, req).await,
        "mining.submit" => handle_submit(server, session, req).await,
        "mining.hashrate" | "eth_submitHashrate" => reply(session, req.id, json!(true)).await,
        _ => unknown_method(server, session, &req).await,
    }
}

async fn reply(session: &Session, id: Value, result: Value) -> Result<Flow> {
    session.send(&StratumResponse::success(id, result)).await?;
    Ok(Flow::Continue)
}

async fn handle_subscribe(session: &Arc<Session>, req: StratumRequest) -> Result<Flow> {
    if let Some(version) = req.str_param(1) {
        if version != PROTOCOL_VERSION {
            tracing::debug!("{} asked for {}, answering as {}", session.ip, version, PROTOCOL_VERSION);
        }
    }

    session.with_state(|st| {
        if st.stage == Stage::Connected {
            st.stage = Stage::Subscribed;
        }
    });

    let result = json!([
        ["mining.notify", session.id, PROTOCOL_VERSION],
        session.extranonce()
    ]);
    reply(session, req.id, result).await
}

/// `login` or `login.worker`.
fn split_worker(name: &str) -> (String, Option<String>) {
    match name.split_once('.') {
        Some((login, worker)) if !worker.is_empty() => (login.to_string(), Some(worker.to_string())),
        Some((login, _)) => (login.to_string(), None),
        None => (name.to_string(), None),
    }
}

async fn handle_authorize(server: &ProxyServer, session: &Arc<Session>, req: StratumRequest) -> Result<Flow> {
    if session.stage() == Stage::Connected {
        return malformed(server, session, req.id, "authorize before subscribe").await;
    }
    let Some(name) = req.str_param(0).filter(|n| !n.is_empty()) else {
        return malformed(server, session, req.id, "missing login").await;
    };
    let (login, worker) = split_worker(name);
    let pass = req.str_param(1).map(str::to_string);

    if !server.authorize(session, &login, worker, pass.as_deref()) {
        let _ = session
            .send(&StratumResponse::error(req.id, StratumError::unauthorized()))
            .await;
        return Ok(Flow::Close);
    }

    reply(session, req.id, json!(true)).await?;
    session
        .send(&Notification::set_difficulty(session.difficulty()))
        .await?;
    if let Some(template) = server.current_template() {
        server.send_job(session, &Job::from_template(&template)).await?;
    }
    Ok(Flow::Continue)
}

async fn handle_submit(server: &ProxyServer, session: &Arc<Session>, req: StratumRequest) -> Result<Flow> {
    if !session.is_authorized() {
        let _ = session
            .send(&StratumResponse::error(req.id, StratumError::unauthorized()))
            .await;
        return Ok(Flow::Close);
    }

    let (Some(_worker), Some(job_id), Some(nonce)) = (req.str_param(0), req.str_param(1), req.str_param(2)) else {
        return malformed(server, session, req.id, "expected [worker, job_id, nonce]").await;
    };

    let extranonce = session.extranonce();
    let nonce = nonce.strip_prefix("0x").unwrap_or(nonce);
    if !is_hex(nonce) || extranonce.len() + nonce.len() != NONCE_HEX_LEN {
        return malformed(server, session, req.id, "malformed nonce").await;
    }

    let Some(job) = server.history().get(job_id) else {
        tracing::debug!("Stale share from {} for job {}", session.ip, job_id);
        session
            .send(&StratumResponse::error(req.id, StratumError::job_not_found()))
            .await?;
        return Ok(Flow::Continue);
    };

    let full_nonce = format!("0x{}{}", extranonce, nonce).to_lowercase();
    match server.submit(session, &full_nonce, &job.header, ZERO_MIX_DIGEST).await {
        Ok(accepted) => {
            reply(session, req.id, json!(accepted)).await?;
            server.record_share(session, accepted).await;
            Ok(Flow::Continue)
        }
        Err(e) => {
            tracing::error!("Failed to forward share from {}: {}", session.ip, e);
            session
                .send(&StratumResponse::error(req.id, StratumError::new(StratumError::UNKNOWN, "Upstream error")))
                .await?;
            Ok(Flow::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_suffix_is_split_off() {
        assert_eq!(split_worker("0xabc.rig1"), ("0xabc".to_string(), Some("rig1".to_string())));
        assert_eq!(split_worker("0xabc."), ("0xabc".to_string(), None));
        assert_eq!(split_worker("0xabc"), ("0xabc".to_string(), None));
    }

    #[test]
    fn zero_mix_digest_is_32_bytes() {
        assert!(crate::blockchain::target::is_prefixed_hex(ZERO_MIX_DIGEST, 64));
    }
}
