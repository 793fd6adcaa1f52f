//! Job-body return values.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{ArgValue, TaskError};

/// What a job body hands back to the success hook.
///
/// Carries a secondary error (the primary action succeeded but some follow-up
/// did not) and the ids of tasks this task spawned. Children are recorded as
/// flat ids; their lifecycles are independent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ArgValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub spawned_tasks: Vec<Uuid>,
}

impl TaskResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(result: impl Into<ArgValue>) -> Self {
        Self {
            result: Some(result.into()),
            ..Self::default()
        }
    }

    /// A result whose only payload is a spawned child.
    pub fn with_spawned(task_id: Uuid) -> Self {
        Self {
            spawned_tasks: vec![task_id],
            ..Self::default()
        }
    }

    pub fn spawn(mut self, task_id: Uuid) -> Self {
        self.spawned_tasks.push(task_id);
        self
    }

    pub fn with_error(mut self, error: TaskError) -> Self {
        self.error = Some(error);
        self
    }
}

impl From<super::client::TaskHandle> for TaskResult {
    /// A dispatched child becomes a result tracking just that child.
    fn from(handle: super::client::TaskHandle) -> Self {
        Self::with_spawned(handle.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_result_is_empty() {
        let result = TaskResult::new();
        assert!(result.result.is_none());
        assert!(result.error.is_none());
        assert!(result.spawned_tasks.is_empty());
    }

    #[test]
    fn spawned_children_accumulate() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let result = TaskResult::with_spawned(a).spawn(b);
        assert_eq!(result.spawned_tasks, vec![a, b]);
    }

    #[test]
    fn handle_converts_to_spawned_result() {
        let handle = crate::dispatch::client::TaskHandle {
            task_id: Uuid::new_v4(),
        };
        let result = TaskResult::from(handle);
        assert_eq!(result.spawned_tasks, vec![handle.task_id]);
    }

    #[test]
    fn value_round_trips_through_json() {
        let result = TaskResult::value("done");
        let json = serde_json::to_value(&result).unwrap();
        let back: TaskResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
