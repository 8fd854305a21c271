use anyhow::Context;

use stockline_api::app::{build_app, services::AppServices};
use stockline_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockline_observability::init();

    let config = AppConfig::from_env()?;
    tracing::info!(?config, "configuration loaded");

    let (services, background) = AppServices::from_config(&config).await?;
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    background.shutdown().await;
    Ok(())
}
