//! The dispatch pipeline.
//!
//! ```text
//! DispatchClient.apply_async_with_reservation(...)
//!     │
//!     ├─► TaskStore: upsert TaskStatus(waiting)
//!     └─► resource_manager queue: ReservationRequest
//!
//! ResourceManager (singleton, lease-holding)
//!     │
//!     ├─► placement: holder wins, else unreserved eligible worker, else wait
//!     ├─► ReservationLedger: reserve rows
//!     └─► worker inbox: Run(envelope), then Release — same FIFO queue
//!
//! WorkerRuntime (per named worker)
//!     │
//!     ├─► Run: pickup check → mark running → job body → on_success/on_failure
//!     └─► Release: clear ledger rows, announce so placement retries
//! ```

pub mod cancel;
pub mod client;
pub mod context;
pub mod heartbeat;
pub mod messages;
pub mod recovery;
pub mod registry;
pub mod resource_manager;
pub mod result;
pub mod service;
pub mod worker_runtime;

pub use cancel::cancel;
pub use client::{DispatchClient, DispatchOptions, TaskHandle};
pub use context::{
    ConsumerAgentClient, DispatcherContext, NoAgentClient, NoScheduleFeedback, ScheduleFeedback,
    TaskContext,
};
pub use heartbeat::{HeartbeatService, MissingWorkerSweeper, SweeperConfig};
pub use messages::{JobEnvelope, ReservationRequest, WorkerMessage};
pub use recovery::delete_worker;
pub use registry::{JobRegistry, SharedJobRegistry};
pub use resource_manager::{
    ResourceManager, ResourceManagerConfig, PLACEMENT_RETRY_INTERVAL,
};
pub use result::TaskResult;
pub use service::{Service, ServiceHost};
pub use worker_runtime::{WorkerRuntime, WorkerRuntimeConfig};

/// The queue every reservation request goes to; its sole consumer is the
/// lease-holding resource manager.
pub const RESOURCE_MANAGER_QUEUE: &str = "resource_manager";
