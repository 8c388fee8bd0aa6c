use anyhow::Context;

use conductor_infra::{Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid CONDUCTOR_* configuration")?;
    let bind = config.bind.clone();

    let orchestrator = Orchestrator::builder(config)
        .with_registry(conductor_api::app::services::builtin_registry()?)
        .build()
        .context("failed to assemble the engine")?;
    let started = orchestrator.start().context("failed to start the engine")?;
    tracing::info!(
        requeued = started.recovery.requeued.len(),
        failed = started.recovery.failed.len(),
        extensions_loaded = started.extensions.is_some(),
        "engine started"
    );

    let app = conductor_api::app::build_app(orchestrator.clone()).await;

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let report = orchestrator.shutdown().await;
    tracing::info!(
        drained = report.drained,
        forced = report.forced.len(),
        "engine stopped"
    );
    Ok(())
}
