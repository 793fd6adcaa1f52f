//! Task lifecycle records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Lifecycle state of a task.
///
/// ```text
///         insert
///   (∅) ─────────▶ waiting
///                    │
///         pickup by worker
///                    ▼
///                 running ──on_success──▶ finished
///                    │  \
///                    │   \──on_failure──▶ error
///                    │
///               cancel (any non-terminal)
///                    ▼
///                canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Running,
    Finished,
    Error,
    Canceled,
    TimedOut,
    Skipped,
}

impl TaskState {
    /// States from which no further transition is allowed.
    pub const TERMINAL: [TaskState; 5] = [
        TaskState::Finished,
        TaskState::Error,
        TaskState::Canceled,
        TaskState::TimedOut,
        TaskState::Skipped,
    ];

    /// States in which a task still has work outstanding.
    pub const INCOMPLETE: [TaskState; 2] = [TaskState::Waiting, TaskState::Running];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_incomplete(&self) -> bool {
        Self::INCOMPLETE.contains(self)
    }
}

/// Durable record of one task's lifecycle.
///
/// Owned by the Task-Status Store; producers, workers, and cancellers race on
/// it, and every mutation path guards terminal states so a finished, errored,
/// or canceled task is never resurrected.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub task_type: String,
    #[builder(default = TaskState::Waiting)]
    pub state: TaskState,
    #[builder(default, setter(strip_option))]
    pub worker_name: Option<String>,
    #[builder(default)]
    pub tags: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub group_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub start_time: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finish_time: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub traceback: Option<String>,
    #[builder(default)]
    pub spawned_tasks: Vec<Uuid>,
}

impl TaskStatus {
    /// A fresh `waiting` record as written by the producer path.
    pub fn waiting(task_id: Uuid, task_type: &str, tags: Vec<String>, group_id: Option<Uuid>) -> Self {
        let mut status = Self::builder()
            .task_id(task_id)
            .task_type(task_type.to_string())
            .tags(tags)
            .build();
        status.group_id = group_id;
        status
    }
}
