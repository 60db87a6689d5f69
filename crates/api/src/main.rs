use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use asyncjob_infra::jobs::{
    DispatchContext, DispatchError, DispatchOutcome, DispatcherRegistry, Job, PoolKind,
};
use asyncjob_server::{app, config};

/// Dispatchers built into the standalone server. Embedders register their own.
fn registry() -> anyhow::Result<DispatcherRegistry> {
    let registry = DispatcherRegistry::builder()
        .register(
            "noop",
            PoolKind::Worker,
            |job: &Job, _ctx: &DispatchContext<'_>| -> Result<DispatchOutcome, DispatchError> {
                Ok(DispatchOutcome::succeeded(Some(json!({ "cmd": job.cmd }))))
            },
        )
        .build()?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log = config::log_config_from_env()?;
    asyncjob_observability::init(&log);
    let config = config::ServerConfig::from_env()?;

    let services = Arc::new(
        app::services::build_services(&config, registry()?)
            .await
            .context("failed to wire job services")?,
    );
    let router = app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %listener.local_addr()?, node_id = %config.job.node_id, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    tokio::task::spawn_blocking(move || services.shutdown()).await?;
    Ok(())
}
