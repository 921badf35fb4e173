use std::net::TcpListener;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use gateway_server::config::Config;
use gateway_server::server::serve;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
    };

    tracing::info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let listener = TcpListener::bind(config.address)
        .with_context(|| format!("failed to bind {}", config.address))?;

    serve(config, listener, shutdown()).await
}
