use std::sync::Arc;

use anyhow::Context;

use courier_api::app::{self, services};
use courier_api::config::AppConfig;
use courier_api::middleware::StaticTokenVerifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let admin_token = config.admin_token.clone().unwrap_or_else(|| {
        tracing::warn!("COURIER_ADMIN_TOKEN not set; using insecure dev default");
        "dev-admin-token".to_string()
    });

    let (services, workers) = services::build_services(&config.queue)
        .await
        .context("failed to start notification services")?;

    let app = app::build_app(services, Arc::new(StaticTokenVerifier::new(admin_token)));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    workers.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
