//! Server binary for ShardSub
//!
//! Loads settings from `config/default.*` and `SHARDSUB__*` variables, starts the
//! router and serves WebSocket clients until Ctrl-C.

use shardsub::broker::Router;
use shardsub::config::{Settings, load_config};
use shardsub::connection::ConnectionRegistry;
use shardsub::transport::{WsHandler, start_websocket_server};
use shardsub::utils::logging;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.log.level);

    if let Err(e) = run_server(config).await {
        error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let router = Arc::new(Router::new(&config.broker)?);
    let registry = ConnectionRegistry::new(WsHandler);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    if config.broker.stats_interval_secs > 0 {
        tokio::spawn(Router::start_stats_loop(
            router.clone(),
            Duration::from_secs(config.broker.stats_interval_secs),
        ));
    }

    tokio::select! {
        result = start_websocket_server(
            listener,
            router.clone(),
            registry.clone(),
            config.broker.max_connections,
        ) => {
            if let Err(e) = result {
                error!("WebSocket server exited unexpectedly: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    let closed = registry.close_all();
    info!(closed, "connections closed");
    router.shutdown().await;

    Ok(())
}
