//! Dependency container and per-operation context.
//!
//! Every dispatch operation takes an explicit [`DispatcherContext`]; there is
//! no ambient broker client or current-task global. Job bodies additionally
//! receive a [`TaskContext`] scoped to the one execution.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::broker::Broker;
use crate::store::{LeaseStore, ReservationLedger, TaskStore, WorkerRegistry};

/// Forwarder for cancelling tasks executing out-of-band on a remote consumer.
///
/// The consumer agent manager itself is an external collaborator; the core
/// only needs this one call.
#[async_trait]
pub trait ConsumerAgentClient: Send + Sync {
    async fn cancel_request(&self, consumer_id: &str, task_id: Uuid) -> Result<()>;
}

/// Sink for schedule outcome bookkeeping. The scheduler tracks consecutive
/// failures per schedule; the worker hooks report outcomes here.
#[async_trait]
pub trait ScheduleFeedback: Send + Sync {
    async fn record_success(&self, schedule_id: Uuid) -> Result<()>;
    async fn record_failure(&self, schedule_id: Uuid) -> Result<()>;
}

/// Default agent client for deployments with no consumer agents.
pub struct NoAgentClient;

#[async_trait]
impl ConsumerAgentClient for NoAgentClient {
    async fn cancel_request(&self, consumer_id: &str, task_id: Uuid) -> Result<()> {
        warn!(
            consumer_id = %consumer_id,
            task_id = %task_id,
            "no consumer agent client configured; cancellation not forwarded"
        );
        Ok(())
    }
}

/// Default feedback sink that ignores outcomes.
pub struct NoScheduleFeedback;

#[async_trait]
impl ScheduleFeedback for NoScheduleFeedback {
    async fn record_success(&self, _schedule_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn record_failure(&self, _schedule_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Shared dependencies for every dispatch operation.
#[derive(Clone)]
pub struct DispatcherContext {
    pub tasks: Arc<dyn TaskStore>,
    pub ledger: Arc<dyn ReservationLedger>,
    pub workers: Arc<dyn WorkerRegistry>,
    pub leases: Arc<dyn LeaseStore>,
    pub broker: Arc<dyn Broker>,
    pub agent_client: Arc<dyn ConsumerAgentClient>,
    pub schedule_feedback: Arc<dyn ScheduleFeedback>,
}

impl DispatcherContext {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        ledger: Arc<dyn ReservationLedger>,
        workers: Arc<dyn WorkerRegistry>,
        leases: Arc<dyn LeaseStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            tasks,
            ledger,
            workers,
            leases,
            broker,
            agent_client: Arc::new(NoAgentClient),
            schedule_feedback: Arc::new(NoScheduleFeedback),
        }
    }

    /// Build from one store implementing every storage trait (the usual case
    /// for both the Postgres store and the in-memory one).
    pub fn from_store<S>(store: Arc<S>, broker: Arc<dyn Broker>) -> Self
    where
        S: TaskStore + ReservationLedger + WorkerRegistry + LeaseStore + 'static,
    {
        Self::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            broker,
        )
    }

    pub fn with_agent_client(mut self, client: Arc<dyn ConsumerAgentClient>) -> Self {
        self.agent_client = client;
        self
    }

    pub fn with_schedule_feedback(mut self, feedback: Arc<dyn ScheduleFeedback>) -> Self {
        self.schedule_feedback = feedback;
        self
    }
}

/// Context for one job execution, handed to the job body.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub worker_name: String,
    /// Cooperative cancellation: fires on revoke or worker shutdown.
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: Uuid, worker_name: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            task_id,
            worker_name: worker_name.into(),
            cancellation,
        }
    }
}
