use std::sync::Arc;

use anyhow::Context;
use taskwatch_infra::TaskwatchConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskwatch_observability::init();

    let config = TaskwatchConfig::from_env().context("invalid configuration")?;
    if let Some(warning) = config.retention_warning() {
        tracing::warn!("{warning}");
    }

    let services = Arc::new(taskwatch_api::app::services::build_services(&config).await?);
    let sweeper = services.tasks.sweeper(config.sweeper_config()).spawn();

    let app = taskwatch_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.shutdown().await;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
