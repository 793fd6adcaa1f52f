//! Durable state: task statuses, the reservation ledger, the worker
//! registry, and singleton role leases.
//!
//! Each collection sits behind a trait so the dispatch layer is storage
//! agnostic. [`postgres::PgStore`] is the production implementation;
//! [`memory::MemoryStore`] mirrors its semantics for tests.
//!
//! Writes that race across processes (status transitions, lease takeover) are
//! expressed as conditional updates so the storage engine's compare-and-set
//! is the arbiter, never in-process locks.

pub mod memory;
pub mod postgres;
pub mod reservation;
pub mod task;
pub mod worker;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use reservation::{roles, Lease, ReservedResource};
pub use task::{TaskState, TaskStatus};
pub use worker::{
    is_user_worker_name, Worker, AGENT_WORKER_NAME, RESOURCE_MANAGER_WORKER_PREFIX,
    SCHEDULER_WORKER_PREFIX,
};

/// Lifecycle records, keyed uniquely by task id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Producer-path upsert. Inserts the record if absent; if a concurrent
    /// writer got there first, only `task_type`, `tags`, and `group_id` are
    /// refreshed — `state` and `start_time` are set on insert only, so a
    /// worker's earlier pickup write is never clobbered.
    async fn upsert_waiting(&self, status: &TaskStatus) -> Result<()>;

    /// Pickup-path upsert. Inserts a `running` record if the producer's
    /// insert is not yet visible; otherwise sets `start_time` and
    /// `worker_name` on every write and moves `waiting → running` without
    /// touching any other state.
    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_name: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()>;

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskStatus>>;

    /// Success hook. Records `finish_time`, `result`, any secondary error,
    /// and spawned children; transitions to `finished` only if the task is
    /// not already terminal (preserving a late cancel).
    async fn finish_success(
        &self,
        task_id: Uuid,
        finish_time: DateTime<Utc>,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        spawned_tasks: &[Uuid],
    ) -> Result<()>;

    /// Failure hook. Records `finish_time`, the serialized error, and the
    /// traceback; transitions to `error` only if not already terminal.
    async fn finish_failure(
        &self,
        task_id: Uuid,
        finish_time: DateTime<Utc>,
        error: serde_json::Value,
        traceback: Option<&str>,
    ) -> Result<()>;

    /// Compare-and-set to `canceled` conditional on the task being
    /// non-terminal. Returns whether the write happened.
    async fn cancel_if_not_terminal(&self, task_id: Uuid) -> Result<bool>;

    /// Producer publish-failure path: flip a non-terminal task to `error`.
    async fn mark_error_if_not_terminal(&self, task_id: Uuid) -> Result<()>;

    /// Tasks assigned to a worker that are still waiting or running.
    async fn incomplete_by_worker(&self, worker_name: &str) -> Result<Vec<TaskStatus>>;
}

/// The reservation ledger: `(task_id, resource_id) → worker_name`.
#[async_trait]
pub trait ReservationLedger: Send + Sync {
    /// Insert one row per resource id, all or nothing.
    async fn reserve(&self, task_id: Uuid, worker_name: &str, resource_ids: &[String])
        -> Result<()>;

    /// Delete every row for a task. Returns the number removed.
    async fn release(&self, task_id: Uuid) -> Result<u64>;

    async fn by_resource(&self, resource_id: &str) -> Result<Option<ReservedResource>>;

    /// The set of workers holding any of the given resources.
    async fn worker_names_for(&self, resource_ids: &[String]) -> Result<HashSet<String>>;

    async fn by_worker(&self, worker_name: &str) -> Result<Vec<ReservedResource>>;

    async fn all_reserved_worker_names(&self) -> Result<HashSet<String>>;

    /// Drop every reservation held on a worker (death cleanup).
    async fn delete_by_worker(&self, worker_name: &str) -> Result<u64>;
}

/// The set of currently online workers, maintained by heartbeats.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn online(&self) -> Result<Vec<Worker>>;

    /// Upsert a worker's heartbeat; first heartbeat creates the record.
    async fn record_heartbeat(&self, name: &str, ts: DateTime<Utc>) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Workers whose last heartbeat is older than the cutoff.
    async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>>;
}

/// Singleton role leases (resource manager, scheduler).
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the role if it is unheld, already ours, or its holder's
    /// heartbeat is older than `ttl`. Returns whether we hold it now.
    async fn try_acquire(
        &self,
        role: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Refresh our heartbeat. Returns false if the lease is no longer ours.
    async fn renew(&self, role: &str, holder: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Graceful shutdown: drop the lease if we hold it.
    async fn release(&self, role: &str, holder: &str) -> Result<()>;

    /// Death cleanup: drop any lease held by the given worker name.
    async fn delete_by_holder(&self, holder: &str) -> Result<u64>;
}
