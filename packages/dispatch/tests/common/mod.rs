//! Shared harness for pipeline tests: in-memory store and broker, real
//! services spawned on the test runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use dispatch_core::dispatch::{
    DispatchClient, DispatcherContext, MissingWorkerSweeper, ResourceManager,
    ResourceManagerConfig, Service, SharedJobRegistry, SweeperConfig, WorkerRuntime,
    WorkerRuntimeConfig,
};
use dispatch_core::store::{MemoryStore, TaskState, TaskStatus, TaskStore, WorkerRegistry};
use dispatch_core::TestBroker;

pub const WAIT_DEADLINE: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<TestBroker>,
    pub ctx: Arc<DispatcherContext>,
    pub client: DispatchClient,
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<anyhow::Result<()>>>,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(TestBroker::new());
        let ctx = Arc::new(DispatcherContext::from_store(store.clone(), broker.clone()));
        let client = DispatchClient::new(ctx.clone());
        Self {
            store,
            broker,
            ctx,
            client,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    fn spawn(&mut self, service: Box<dyn Service>) {
        let token = self.shutdown.clone();
        self.handles.push(tokio::spawn(service.run(token)));
    }

    pub fn start_resource_manager(&mut self) {
        let config = ResourceManagerConfig {
            name: "resource_manager@test".to_string(),
            lease_ttl: chrono::Duration::seconds(30),
            renew_interval: Duration::from_millis(50),
            placement_retry_interval: Duration::from_millis(25),
        };
        self.spawn(Box::new(ResourceManager::new(self.ctx.clone(), config)));
    }

    /// Register the worker as online and start its runtime.
    pub async fn start_worker(&mut self, name: &str, registry: SharedJobRegistry) {
        self.store
            .record_heartbeat(name, Utc::now())
            .await
            .expect("heartbeat");
        self.spawn(Box::new(WorkerRuntime::new(
            self.ctx.clone(),
            registry,
            WorkerRuntimeConfig::new(name),
        )));
    }

    pub fn start_sweeper(&mut self, missing_timeout: Duration, sweep_interval: Duration) {
        self.spawn(Box::new(MissingWorkerSweeper::new(
            self.ctx.clone(),
            SweeperConfig {
                name: "scheduler@test".to_string(),
                missing_timeout,
                sweep_interval,
            },
        )));
    }

    /// Poll until the task reaches the expected state.
    pub async fn wait_for_state(&self, task_id: Uuid, state: TaskState) -> TaskStatus {
        let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
        loop {
            if let Some(status) = self.store.get(task_id).await.expect("status read") {
                if status.state == state {
                    return status;
                }
            }
            if tokio::time::Instant::now() > deadline {
                let current = self.store.get(task_id).await.unwrap();
                panic!("task {task_id} never reached {state:?}; current: {current:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Fetch a status row that must exist.
    pub async fn task(&self, task_id: Uuid) -> TaskStatus {
        self.store
            .get(task_id)
            .await
            .expect("status read")
            .expect("status row")
    }

    /// Poll until a condition over the store holds.
    pub async fn wait_until(&self, what: &str, condition: impl Fn(&MemoryStore) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
        while !condition(&self.store) {
            if tokio::time::Instant::now() > deadline {
                panic!("condition never held: {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Named gates for holding job bodies open until the test lets them finish.
#[derive(Clone, Default)]
pub struct Gates {
    inner: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl Gates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Arc<Semaphore> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    /// Let one execution waiting on this gate proceed.
    pub fn open(&self, name: &str) {
        self.get(name).add_permits(1);
    }
}
