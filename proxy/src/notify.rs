/// HTTP work-notification endpoint
///
/// The upstream node POSTs to `/` when it has new work; the proxy then
/// refreshes its template immediately instead of waiting for the timer.
/// `/health` and `/metrics` sit on the same listener.

use axum::{
    extract::{ConnectInfo, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::metrics::prometheus as metrics;
use crate::server::ProxyServer;

pub fn router(server: Arc<ProxyServer>) -> Router {
    Router::new()
        .route("/", any(work_notification))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .with_state(server)
}

pub async fn serve(listener: TcpListener, server: Arc<ProxyServer>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Starting work listener on {}", addr);
    }
    axum::serve(
        listener,
        router(server).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn work_notification(
    State(server): State<Arc<ProxyServer>>,
    method: Method,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if method != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("rpc: POST method required, received {}", method),
        )
            .into_response();
    }

    let ip = peer
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::info!("Received new job notification from {}", ip);
    metrics::inc_work_notifications();

    server.refresh_template().await;
    StatusCode::OK.into_response()
}

async fn health(State(server): State<Arc<ProxyServer>>) -> impl IntoResponse {
    let report = server.health();
    let status = if report.status == "ok" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

async fn render_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
