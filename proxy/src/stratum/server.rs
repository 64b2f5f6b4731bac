/// Stratum TCP listener
///
/// One task per connection. Each task reads newline-delimited JSON requests
/// with an idle timeout and hands them to the configured dialect. Any exit
/// from the read loop unregisters the session.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::protocol::{StratumError, StratumRequest, StratumResponse};
use super::{eth_proxy, ethstratum};
use crate::config::Protocol;
use crate::server::ProxyServer;
use crate::session::Session;

/// Longest request line we accept.
const MAX_LINE: usize = 16 * 1024;

/// What the read loop does after a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Bind the stratum socket with SO_REUSEADDR.
pub fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let sock_addr: SocketAddr = addr.parse().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid address '{}': {}", addr, e))
    })?;

    let domain = if sock_addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(sock_addr))?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Accept loop. Runs until the listener fails.
pub async fn serve(server: Arc<ProxyServer>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Stratum listening on {} ({})", addr, server.protocol().name());
    }

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let ip = peer_addr.ip().to_string();
                if server.policy().is_banned(&ip) {
                    tracing::debug!("Rejecting banned {}", ip);
                    continue;
                }

                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(server, socket, ip.clone()).await {
                        tracing::debug!("Connection error from {}: {}", ip, e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(server: Arc<ProxyServer>, socket: TcpStream, ip: String) -> Result<()> {
    let _ = socket.set_nodelay(true);
    let (reader, writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    let session = server.open_session(ip, Box::new(writer));
    tracing::debug!("New session {} from {}", session.id, session.ip);

    let result = read_loop(&server, &session, &mut reader).await;

    server.close_session(&session);
    session.shutdown().await;
    tracing::debug!("Session {} from {} closed", session.id, session.ip);
    result
}

async fn read_loop(
    server: &ProxyServer,
    session: &Arc<Session>,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<()> {
    let timeout = server.config().stratum_timeout();
    let mut line = String::new();

    loop {
        line.clear();

        // One byte past the cap tells an over-long line from one that fits.
        let mut bounded = (&mut *reader).take(MAX_LINE as u64 + 1);
        match tokio::time::timeout(timeout, bounded.read_line(&mut line)).await {
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::info!("Session {} from {} timed out", session.id, session.ip);
                return Ok(());
            }
        }

        if line.len() > MAX_LINE && !line.ends_with('\n') {
            server.policy().apply_malformed_policy(&session.ip);
            return Err(anyhow!("request line too long ({} bytes)", line.len()));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: StratumRequest = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                server.policy().apply_malformed_policy(&session.ip);
                return Err(anyhow!("invalid JSON: {}", e));
            }
        };

        let flow = match server.protocol() {
            Protocol::StratumProxy => eth_proxy::handle(server, session, request).await?,
            Protocol::EthereumStratum => ethstratum::handle(server, session, request).await?,
        };
        if flow == Flow::Close {
            return Ok(());
        }
    }
}

/// Reject a malformed request and close the session.
pub(crate) async fn malformed(server: &ProxyServer, session: &Session, id: Value, reason: &str) -> Result<Flow> {
    server.policy().apply_malformed_policy(&session.ip);
    tracing::warn!("Malformed request from {}: {}", session.ip, reason);
    let _ = session
        .send(&StratumResponse::error(id, StratumError::invalid_params(reason)))
        .await;
    Ok(Flow::Close)
}

/// Reply with `error`, closing unless the session is already authorized.
pub(crate) async fn unknown_method(server: &ProxyServer, session: &Session, request: &StratumRequest) -> Result<Flow> {
    tracing::debug!("Unknown method {} from {}", request.method, session.ip);
    session
        .send(&StratumResponse::error(request.id.clone(), StratumError::invalid_method(&request.method)))
        .await?;

    if session.is_authorized() {
        Ok(Flow::Continue)
    } else {
        server.policy().apply_malformed_policy(&session.ip);
        Ok(Flow::Close)
    }
}
