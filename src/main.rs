use anyhow::{Context, Result};
use tracing::{info, warn};
use v2g_dispatch::{api, config, controller, telemetry};

use config::Config;
use telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!("binding to 0.0.0.0, the signal endpoint is reachable from the network");
    }

    let state = controller::AppState::new(cfg)
        .await
        .context("building dispatch service")?;
    let tasks = controller::spawn_controller_tasks(&state);

    let app = api::router(state.clone());
    info!(%addr, strategy = state.manager.dispatcher_name(), "starting V2G dispatch service");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    state.shutdown().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("shutdown complete");
    Ok(())
}
