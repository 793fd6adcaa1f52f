// Common types shared across the store, broker, and dispatch layers.

pub mod envelope;
pub mod error;
pub mod tags;

pub use envelope::{ArgValue, JobArgs, ObjectRef};
pub use error::{DispatchError, ErrorCode, TaskError};
