//! Worker liveness: heartbeat writer and missed-heartbeat sweeper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::DispatcherContext;
use super::recovery::delete_worker;
use super::service::Service;
use crate::store::roles;

/// Periodically records a heartbeat for one registered name.
///
/// On shutdown it announces the departure, which runs the same cleanup as
/// death recovery but logged as a normal event.
pub struct HeartbeatService {
    ctx: Arc<DispatcherContext>,
    name: String,
    interval: Duration,
}

impl HeartbeatService {
    pub fn new(ctx: Arc<DispatcherContext>, name: impl Into<String>, interval: Duration) -> Self {
        Self {
            ctx,
            name: name.into(),
            interval,
        }
    }
}

#[async_trait]
impl Service for HeartbeatService {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(worker = %self.name, "heartbeat starting");

        loop {
            if let Err(e) = self.ctx.workers.record_heartbeat(&self.name, Utc::now()).await {
                warn!(worker = %self.name, error = %e, "failed to record heartbeat");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        delete_worker(&self.ctx, &self.name, true).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Registry name of this sweeper instance, e.g. `scheduler@host1`.
    pub name: String,
    /// A worker whose last heartbeat is older than this is declared gone.
    pub missing_timeout: Duration,
    /// How often to scan the registry.
    pub sweep_interval: Duration,
}

/// Evicts workers whose heartbeats have gone missing.
///
/// Runs under the scheduler lease so only one instance sweeps at a time;
/// instances that fail to acquire simply skip the tick.
pub struct MissingWorkerSweeper {
    ctx: Arc<DispatcherContext>,
    config: SweeperConfig,
}

impl MissingWorkerSweeper {
    pub fn new(ctx: Arc<DispatcherContext>, config: SweeperConfig) -> Self {
        Self { ctx, config }
    }

    async fn sweep(&self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.missing_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        for worker in self.ctx.workers.stale(cutoff).await? {
            // Never sweep ourselves on a slow tick.
            if worker.name == self.config.name {
                continue;
            }
            delete_worker(&self.ctx, &worker.name, false).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Service for MissingWorkerSweeper {
    fn name(&self) -> &'static str {
        "missing-worker-sweeper"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(name = %self.config.name, "sweeper starting");

        // The scheduler lease TTL follows the missing-timeout: a sweeper that
        // stops renewing is itself treated as gone.
        let lease_ttl = chrono::Duration::from_std(self.config.missing_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }

            let held = self
                .ctx
                .leases
                .try_acquire(roles::SCHEDULER, &self.config.name, Utc::now(), lease_ttl)
                .await?;
            if !held {
                continue;
            }

            if let Err(e) = self.sweep().await {
                warn!(error = %e, "sweep failed");
            }
        }

        self.ctx
            .leases
            .release(roles::SCHEDULER, &self.config.name)
            .await?;
        info!(name = %self.config.name, "sweeper stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TestBroker;
    use crate::store::{MemoryStore, WorkerRegistry};

    #[tokio::test]
    async fn sweep_removes_only_stale_workers() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(DispatcherContext::from_store(
            store.clone(),
            Arc::new(TestBroker::new()),
        ));

        store
            .record_heartbeat("w1", Utc::now() - chrono::Duration::seconds(120))
            .await
            .unwrap();
        store.record_heartbeat("w2", Utc::now()).await.unwrap();

        let sweeper = MissingWorkerSweeper::new(
            ctx,
            SweeperConfig {
                name: "scheduler@test".into(),
                missing_timeout: Duration::from_secs(30),
                sweep_interval: Duration::from_millis(10),
            },
        );
        sweeper.sweep().await.unwrap();

        let online = store.online().await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].name, "w2");
    }

    #[tokio::test]
    async fn heartbeat_service_registers_and_deregisters() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(DispatcherContext::from_store(
            store.clone(),
            Arc::new(TestBroker::new()),
        ));

        let shutdown = CancellationToken::new();
        let service = Box::new(HeartbeatService::new(
            ctx,
            "w1",
            Duration::from_millis(10),
        ));
        let handle = tokio::spawn(service.run(shutdown.clone()));

        // Wait for the first heartbeat to land.
        for _ in 0..100 {
            if !store.online().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.online().await.unwrap().len(), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(store.online().await.unwrap().is_empty());
    }
}
