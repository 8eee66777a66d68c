//! Spin Cricket Game Server
//!
//! Serves two-player cricket rooms over WebSocket.

use std::sync::Arc;
use tracing::{info, error};
use tracing_subscriber::EnvFilter;

use spin_cricket::{GameServer, ServerConfig, VERSION};

#[cfg(feature = "debug-tracing")]
const DEFAULT_LOG_LEVEL: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let config = ServerConfig::from_env();

    info!("Spin Cricket Server v{}", VERSION);
    info!(
        "Balls per innings: {}, wickets per innings: {}",
        config.rules.ball_quota, config.rules.wicket_quota
    );

    let server = Arc::new(GameServer::new(config));

    let runner = server.clone();
    let mut handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Ctrl-C received, shutting down");
            server.shutdown();
        }
        result = &mut handle => {
            match result? {
                Ok(()) => info!("Server stopped"),
                Err(e) => {
                    error!("Server failed: {}", e);
                    return Err(e.into());
                }
            }
            return Ok(());
        }
    }

    handle.await??;
    Ok(())
}
