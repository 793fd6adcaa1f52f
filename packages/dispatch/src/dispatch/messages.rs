//! Wire messages between the producer, the resource manager, and workers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::JobArgs;

/// A request on the resource-manager queue asking for placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReservationRequest {
    /// Reserve a single resource before dispatch.
    Single {
        job_name: String,
        task_id: Uuid,
        resource_id: String,
        args: JobArgs,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schedule_id: Option<Uuid>,
    },
    /// Reserve several resources atomically before dispatch.
    Multi {
        job_name: String,
        task_id: Uuid,
        resource_ids: Vec<String>,
        args: JobArgs,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schedule_id: Option<Uuid>,
    },
}

impl ReservationRequest {
    pub fn task_id(&self) -> Uuid {
        match self {
            ReservationRequest::Single { task_id, .. }
            | ReservationRequest::Multi { task_id, .. } => *task_id,
        }
    }

    /// Flatten into the fields placement and dispatch need. The returned
    /// resource list has one element for a single-resource request.
    pub fn into_parts(self) -> (String, Uuid, Vec<String>, JobArgs, Option<Uuid>) {
        match self {
            ReservationRequest::Single {
                job_name,
                task_id,
                resource_id,
                args,
                schedule_id,
            } => (job_name, task_id, vec![resource_id], args, schedule_id),
            ReservationRequest::Multi {
                job_name,
                task_id,
                resource_ids,
                args,
                schedule_id,
            } => (job_name, task_id, resource_ids, args, schedule_id),
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, ReservationRequest::Multi { .. })
    }
}

/// The real job as forwarded to a worker's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_name: String,
    pub task_id: Uuid,
    pub args: JobArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
}

/// Messages on a worker's dedicated queue.
///
/// The resource manager enqueues `Run` strictly before `Release` on the same
/// FIFO queue, so release processing always observes a settled job (or a dead
/// worker, which the sweeper covers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    Run(JobEnvelope),
    Release { task_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_request_round_trips() {
        let request = ReservationRequest::Single {
            job_name: "repo_sync".into(),
            task_id: Uuid::new_v4(),
            resource_id: "repository:foo".into(),
            args: JobArgs::new(),
            schedule_id: None,
        };
        let json = serde_json::to_vec(&request).unwrap();
        let back: ReservationRequest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, request);
        assert!(!back.is_multi());
    }

    #[test]
    fn multi_request_flattens_all_resources() {
        let request = ReservationRequest::Multi {
            job_name: "repo_publish".into(),
            task_id: Uuid::new_v4(),
            resource_ids: vec!["repository:a".into(), "repository:b".into()],
            args: JobArgs::new(),
            schedule_id: None,
        };
        let (_, _, resources, _, _) = request.into_parts();
        assert_eq!(resources.len(), 2);
    }

    #[test]
    fn worker_message_is_tagged() {
        let message = WorkerMessage::Release {
            task_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""kind":"release""#));
    }
}
