use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use agentops_agents::{AgentExecutor, ExecutorRegistry, HttpModelExecutor, ScriptedExecutor};
use agentops_infra::{
    Daemon, InMemoryStore, Orchestrator, OrchestratorStore, PostgresStore, RunnerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agentops_observability::init();

    let config = RunnerConfig::from_env().context("invalid runner configuration")?;
    tracing::info!(
        runner_id = %config.runner_id,
        environment = %config.environment,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        lease_ms = config.lease.as_millis() as u64,
        "starting agent runner"
    );

    let executor = build_executor(&config)?;

    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to postgres")?;
            let store = PostgresStore::new(pool).with_lease(config.lease);
            store.migrate().await.context("failed to apply schema")?;
            serve(store, executor, &config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store (state is lost on exit)");
            serve(InMemoryStore::new().with_lease(config.lease), executor, &config).await
        }
    }
}

fn build_executor(config: &RunnerConfig) -> anyhow::Result<Arc<dyn AgentExecutor>> {
    let fallback: Arc<dyn AgentExecutor> = match &config.model {
        Some(model) => {
            tracing::info!(base_url = %model.base_url, model = %model.model, "using model provider");
            Arc::new(HttpModelExecutor::new(model.http_model_config()).context("model client")?)
        }
        None => {
            tracing::warn!("AGENTOPS_MODEL_BASE_URL not set; jobs are echoed by the scripted executor");
            Arc::new(ScriptedExecutor::echo())
        }
    };
    Ok(Arc::new(ExecutorRegistry::new().with("*", fallback)))
}

async fn serve<S>(
    store: S,
    executor: Arc<dyn AgentExecutor>,
    config: &RunnerConfig,
) -> anyhow::Result<()>
where
    S: OrchestratorStore + 'static,
{
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        executor,
        config.orchestrator_config(),
    ));
    let handle = Daemon::new(orchestrator, config.daemon_config()).start();

    shutdown_signal().await;
    tracing::info!("shutdown requested; waiting for the cycle in flight");

    let stats = handle.stop().await;
    tracing::info!(
        ticks = stats.ticks,
        succeeded = stats.succeeded,
        failed = stats.failed,
        contended = stats.contended,
        skipped = stats.skipped,
        idle = stats.idle,
        loop_errors = stats.loop_errors,
        swept_leases = stats.swept_leases,
        "agent runner stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
