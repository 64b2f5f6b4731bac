/// Stratum-Proxy dialect (eth-proxy)
///
/// Miners log in with `eth_submitLogin`, poll `eth_getWork` and post
/// solutions with `eth_submitWork`. New work is pushed unsolicited as a
/// response with id 0.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;

use super::protocol::{work_result, StratumError, StratumRequest, StratumResponse};
use super::server::{malformed, unknown_method, Flow};
use crate::blockchain::target::{is_prefixed_hex, target_from_difficulty};
use crate::blockchain::template::job_id_for_header;
use crate::jobs::Job;
use crate::server::ProxyServer;
use crate::session::Session;

pub async fn handle(server: &ProxyServer, session: &Arc<Session>, req: StratumRequest) -> Result<Flow> {
    match req.method.as_str() {
        "eth_submitLogin" => handle_login(server, session, req).await,
        "eth_getWork" => handle_get_work(server, session, req).await,
        "eth_submitWork" => handle_submit(server, session, req).await,
        "eth_submitHashrate" => reply(session, req.id, json!(true)).await,
        _ => unknown_method(server, session, &req).await,
    }
}

async fn reply(session: &Session, id: Value, result: Value) -> Result<Flow> {
    session.send(&StratumResponse::success(id, result)).await?;
    Ok(Flow::Continue)
}

async fn refuse(session: &Session, id: Value, error: StratumError) -> Result<Flow> {
    let _ = session.send(&StratumResponse::error(id, error)).await;
    Ok(Flow::Close)
}

async fn handle_login(server: &ProxyServer, session: &Arc<Session>, req: StratumRequest) -> Result<Flow> {
    let Some(login) = req.str_param(0).filter(|l| !l.is_empty()) else {
        return malformed(server, session, req.id, "missing login").await;
    };
    let login = login.to_string();
    let pass = req.str_param(1).map(str::to_string);

    if !server.authorize(session, &login, req.worker.clone(), pass.as_deref()) {
        return refuse(session, req.id, StratumError::unauthorized()).await;
    }
    reply(session, req.id, json!(true)).await
}

async fn handle_get_work(server: &ProxyServer, session: &Arc<Session>, req: StratumRequest) -> Result<Flow> {
    if !session.is_authorized() {
        return refuse(session, req.id, StratumError::not_subscribed()).await;
    }

    let Some(template) = server.current_template() else {
        session
            .send(&StratumResponse::error(req.id, StratumError::no_work()))
            .await?;
        return Ok(Flow::Continue);
    };

    let job = Job::from_template(&template);
    session.with_state(|st| st.current_job_id = Some(job.job_id.clone()));
    let share_target = target_from_difficulty(session.difficulty());
    reply(session, req.id, work_result(&job, &share_target)).await
}

async fn handle_submit(server: &ProxyServer, session: &Arc<Session>, req: StratumRequest) -> Result<Flow> {
    if !session.is_authorized() {
        return refuse(session, req.id, StratumError::not_subscribed()).await;
    }

    let (Some(nonce), Some(header), Some(mix)) = (req.str_param(0), req.str_param(1), req.str_param(2)) else {
        return malformed(server, session, req.id, "expected [nonce, header, mix]").await;
    };
    if !is_prefixed_hex(nonce, 16) || !is_prefixed_hex(header, 64) || !is_prefixed_hex(mix, 64) {
        return malformed(server, session, req.id, "malformed solution").await;
    }

    if server.history().get(&job_id_for_header(header)).is_none() {
        tracing::debug!("Stale share from {} for header {}", session.ip, header);
        session
            .send(&StratumResponse::error(req.id, StratumError::job_not_found()))
            .await?;
        return Ok(Flow::Continue);
    }

    let (nonce, header, mix) = (nonce.to_lowercase(), header.to_lowercase(), mix.to_lowercase());
    match server.submit(session, &nonce, &header, &mix).await {
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
