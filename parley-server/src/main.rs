//! parley gateway node.
//!
//! Configuration comes from `PARLEY_*` environment variables; log level
//! from `RUST_LOG` (default `info`).

mod seed;

use parley_gateway::config::{ConfigError, GatewayConfig};
use parley_gateway::error::ChatError;
use parley_gateway::gateway::{Gateway, GatewayError};
use parley_gateway::server::{ChatServer, ServerError};
use std::process::ExitCode;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::seed::SeedError;

#[derive(Debug, Error)]
enum AppError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("startup: {0}")]
    Gateway(#[from] GatewayError),
    #[error("seed: {0}")]
    Seed(#[from] SeedError),
    #[error("seed: {0}")]
    SeedApply(#[from] ChatError),
    #[error("server: {0}")]
    Server(#[from] ServerError),
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

async fn run() -> Result<(), AppError> {
    let config = GatewayConfig::from_env()?;
    log::info!(
        "Starting parley on {} (presence/fan-out: {}, storage: {})",
        config.bind_addr,
        config.redis_url.as_deref().unwrap_or("in-process"),
        config
            .data_dir
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string()),
    );

    let gateway = Gateway::builder(config.clone()).build().await?;

    let sessions = seed::parse_sessions(&std::env::var("PARLEY_SEED_SESSIONS").unwrap_or_default())?;
    let chats = seed::parse_chats(&std::env::var("PARLEY_SEED_CHATS").unwrap_or_default())?;
    let (seeded_sessions, seeded_chats) = seed::apply(&gateway, sessions, chats).await?;
    if seeded_sessions + seeded_chats > 0 {
        log::info!("Seeded {seeded_sessions} sessions and {seeded_chats} chats");
    }

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(ServerError::Io)?;
    ChatServer::new(gateway).run_until(listener, shutdown_signal()).await?;

    // Let connection tasks flush their close frames.
    tokio::time::sleep(Duration::from_millis(250)).await;
    log::info!("parley stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
