mod api;
mod config;
mod error;
mod main_lib;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    let state = main_lib::build_state(&config).await?;
    state.scheduler.start(state.engine.clone()).await;

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("bankfeed-server listening on {}", config.bind_addr);
    axum::serve(listener, api::app_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    state.scheduler.stop().await;
    state.engine.persist().await?;
    Ok(())
}
