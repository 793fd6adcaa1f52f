//! Reservation ledger rows and singleton role leases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A durable claim: `task_id` holds `resource_id` on `worker_name`.
///
/// A multi-resource job writes one row per resource, all sharing its
/// `task_id`. Rows are inserted by the Resource Manager at placement and
/// deleted by the release step or the death sweeper.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedResource {
    pub task_id: Uuid,
    pub worker_name: String,
    pub resource_id: String,
}

impl ReservedResource {
    pub fn new(task_id: Uuid, worker_name: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            task_id,
            worker_name: worker_name.into(),
            resource_id: resource_id.into(),
        }
    }
}

/// Singleton role names that may hold a [`Lease`].
pub mod roles {
    pub const RESOURCE_MANAGER: &str = "resource_manager";
    pub const SCHEDULER: &str = "scheduler";
}

/// A singleton lease proving "I am the active holder of this role".
///
/// The holder name is the same string the process registers in the worker
/// registry. Renewed by heartbeat; removed on graceful shutdown or when the
/// holder's worker record is swept, at which point any standby may acquire.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub role: String,
    pub holder: String,
    pub last_heartbeat: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_compare_by_value() {
        let id = Uuid::new_v4();
        assert_eq!(
            ReservedResource::new(id, "w1", "repository:foo"),
            ReservedResource::new(id, "w1", "repository:foo"),
        );
    }
}
