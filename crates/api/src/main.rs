use std::sync::Arc;

use anyhow::Context;

use dialtone_api::{app, config::AppConfig};
use dialtone_infra::StatusSweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dialtone_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        app::build_services(&config)
            .await
            .context("failed to build services")?,
    );

    let sweeper = StatusSweeper::new(services.orchestrator.clone(), config.sweeper.clone()).spawn();
    let router = app::build_app(&config.jwt_secret, services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
