//! Online workers and the reserved-name predicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Name prefix for the resource-manager role. Also the name of its queue.
pub const RESOURCE_MANAGER_WORKER_PREFIX: &str = "resource_manager";

/// Name prefix for the scheduler role.
pub const SCHEDULER_WORKER_PREFIX: &str = "scheduler";

/// Synthetic worker name for tasks executed out-of-band on a remote consumer.
pub const AGENT_WORKER_NAME: &str = "agent";

/// A worker currently (or recently) online.
///
/// Created on first heartbeat; removed by the missed-heartbeat sweeper or a
/// graceful shutdown announcement.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    pub fn new(name: impl Into<String>, last_heartbeat: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            last_heartbeat,
        }
    }
}

/// Whether a worker name may be assigned user work.
///
/// The scheduler and resource-manager processes register in the same registry
/// but must never receive reserved jobs. Matching is prefix-based because the
/// host suffix of a name varies (`resource_manager@host1`).
pub fn is_user_worker_name(name: &str) -> bool {
    !name.starts_with(SCHEDULER_WORKER_PREFIX) && !name.starts_with(RESOURCE_MANAGER_WORKER_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefixes_are_excluded() {
        assert!(!is_user_worker_name("resource_manager@host1"));
        assert!(!is_user_worker_name("scheduler@host2"));
    }

    #[test]
    fn ordinary_names_are_eligible() {
        assert!(is_user_worker_name("worker1@host1"));
        assert!(is_user_worker_name("agent"));
    }

    #[test]
    fn prefix_match_is_not_substring_match() {
        assert!(is_user_worker_name("my_resource_manager@host1"));
    }
}
