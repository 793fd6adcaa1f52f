//! Reserved-task dispatch core.
//!
//! Schedules asynchronous jobs that declare the named resources they touch,
//! guaranteeing that no two jobs claiming overlapping resources run
//! concurrently. A durable reservation ledger enforces exclusion across
//! processes and restarts; a singleton resource manager places work onto
//! workers ("holder wins"); every task leaves a queryable lifecycle record;
//! missed heartbeats trigger cleanup that releases reservations and cancels
//! orphaned tasks.

pub mod broker;
pub mod common;
pub mod config;
pub mod dispatch;
pub mod signal;
pub mod store;

pub use broker::{Broker, ControlEvent, NatsBroker, TestBroker};
pub use common::{ArgValue, DispatchError, ErrorCode, JobArgs, ObjectRef, TaskError};
pub use config::{Config, NodeRole};
pub use dispatch::{
    cancel, delete_worker, DispatchClient, DispatchOptions, DispatcherContext, HeartbeatService,
    JobRegistry, MissingWorkerSweeper, ResourceManager, ResourceManagerConfig, Service,
    ServiceHost, SharedJobRegistry, SweeperConfig, TaskContext, TaskHandle, TaskResult,
    WorkerRuntime, WorkerRuntimeConfig, RESOURCE_MANAGER_QUEUE,
};
pub use signal::TermSignalScope;
pub use store::{
    MemoryStore, PgStore, ReservedResource, TaskState, TaskStatus, Worker,
};
