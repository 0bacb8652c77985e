use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod service;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        bind = %config.bind,
        db = %config.db_path.display(),
        snapshot = %config.snapshot_path.display(),
        "presencad starting"
    );

    let bind = config.bind;
    let service = Arc::new(service::Service::start(config).await?);
    let app = api::router(service);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "presencad ready");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("presencad shutting down");
        })
        .await?;

    Ok(())
}
