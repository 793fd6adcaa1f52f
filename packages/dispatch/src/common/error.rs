//! Error types recognized by the dispatch core.
//!
//! The core distinguishes a small set of failure categories; everything else
//! travels as `anyhow::Error` through job bodies and is recorded on the
//! status row as an uncoded failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Machine-readable codes for failures the system itself synthesizes.
///
/// Coded failures are recorded on the status row without a traceback; an
/// operator can act on the code alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The release step found the task still `running`. The reservation is
    /// removed regardless; the task is marked errored with this code.
    ReleasedWhileRunning,
    /// The task's worker disappeared before the task completed.
    WorkerTerminated,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::ReleasedWhileRunning => write!(f, "released_while_running"),
            ErrorCode::WorkerTerminated => write!(f, "worker_terminated"),
        }
    }
}

/// Errors surfaced by dispatch-core operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Placement found zero eligible workers. Recovered internally by
    /// sleep-and-retry; callers never observe this.
    #[error("no unreserved workers available")]
    NoWorkers,

    /// The caller referenced a task that does not exist.
    #[error("task {0} does not exist")]
    MissingTask(Uuid),

    /// An insert collided with a concurrent writer after the single retry.
    #[error("duplicate insert for task {0}")]
    DuplicateInsert(Uuid),

    /// A failure the system declared a code for. Logged at info without a
    /// traceback.
    #[error("{code}: {message}")]
    Coded { code: ErrorCode, message: String },

    /// Anything else raised by a job body. Recorded with its full chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        DispatchError::Coded {
            code,
            message: message.into(),
        }
    }

    /// The code, if this is a declared-code failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            DispatchError::Coded { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// The serialized form of a failure as stored on the status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl TaskError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl From<&DispatchError> for TaskError {
    fn from(err: &DispatchError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
