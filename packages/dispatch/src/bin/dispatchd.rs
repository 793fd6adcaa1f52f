// Dispatch node entry point: runs worker, resource-manager, or scheduler
// services depending on the configured role.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatch_core::dispatch::{
    HeartbeatService, MissingWorkerSweeper, ResourceManager, ResourceManagerConfig, ServiceHost,
    SweeperConfig, WorkerRuntime, WorkerRuntimeConfig,
};
use dispatch_core::{Config, DispatcherContext, JobRegistry, NatsBroker, NodeRole, PgStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dispatch_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(role = ?config.role, node_id = %config.node_id, "starting dispatch node");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let nats = async_nats::connect(&config.nats_url)
        .await
        .context("failed to connect to NATS")?;

    let ctx = Arc::new(DispatcherContext::from_store(
        Arc::new(PgStore::new(pool)),
        Arc::new(NatsBroker::new(nats)),
    ));

    let mut host = ServiceHost::new();

    match config.role {
        NodeRole::Worker => {
            // Job bodies are registered by the deployment linking this crate;
            // the bare daemon ships with an empty registry.
            let registry = Arc::new(JobRegistry::new());
            tracing::info!(
                slots = config.worker_slots,
                jobs = registry.registered_names().len(),
                "hosting worker runtimes"
            );

            for slot in 1..=config.worker_slots {
                let name = config.worker_name(slot);
                let mut runtime_config = WorkerRuntimeConfig::new(&name);
                if let Some(dir) = &config.work_dir {
                    runtime_config = runtime_config.with_work_dir(dir.join(&name));
                }
                if config.profiling_enabled {
                    runtime_config = runtime_config.with_profiling_dir(&config.profiling_dir);
                }

                host = host
                    .with_service(WorkerRuntime::new(
                        ctx.clone(),
                        registry.clone(),
                        runtime_config,
                    ))
                    .with_service(HeartbeatService::new(
                        ctx.clone(),
                        name,
                        config.heartbeat_interval,
                    ));
            }
        }
        NodeRole::ResourceManager => {
            let name = config.resource_manager_name();
            host = host
                .with_service(ResourceManager::new(
                    ctx.clone(),
                    ResourceManagerConfig::with_name(&name),
                ))
                .with_service(HeartbeatService::new(
                    ctx.clone(),
                    name,
                    config.heartbeat_interval,
                ));
        }
        NodeRole::Scheduler => {
            let name = config.scheduler_name();
            host = host
                .with_service(MissingWorkerSweeper::new(
                    ctx.clone(),
                    SweeperConfig {
                        name: name.clone(),
                        missing_timeout: config.missing_timeout,
                        sweep_interval: config.heartbeat_interval,
                    },
                ))
                .with_service(HeartbeatService::new(
                    ctx.clone(),
                    name,
                    config.heartbeat_interval,
                ));
        }
    }

    host.run_until_shutdown().await
}
