// Ethash stratum proxy
//
// Fronts one or more ethash nodes for many miners: picks the healthy
// upstream, relays work over Stratum-Proxy or EthereumStratum and forwards
// solutions back.

use stratum_proxy::{Config, ProxyServer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    tracing::info!("Loading config from {}", path);

    let cfg = match Config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let server = match ProxyServer::from_config(cfg) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        res = server.start() => {
            if let Err(e) = res {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("Proxy shut down");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}
