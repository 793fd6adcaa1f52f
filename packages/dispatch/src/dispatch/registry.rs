//! Registry mapping job names to executable bodies.
//!
//! Workers claim envelopes off their inbox knowing only the job name; the
//! registry resolves the name to a handler and runs it with the decoded
//! arguments and the per-execution context.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;

use super::context::{DispatcherContext, TaskContext};
use super::result::TaskResult;
use crate::common::{DispatchError, JobArgs};

type BoxedJobHandler = Box<
    dyn Fn(
            JobArgs,
            TaskContext,
            Arc<DispatcherContext>,
        ) -> Pin<Box<dyn Future<Output = Result<TaskResult, DispatchError>> + Send>>
        + Send
        + Sync,
>;

/// Maps job names to handlers.
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register("repo_sync", |args, task, ctx| async move {
///     sync_repository(args, &task, &ctx).await?;
///     Ok(TaskResult::new())
/// });
/// ```
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, BoxedJobHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a job body under a name.
    pub fn register<F, Fut>(&mut self, job_name: impl Into<String>, handler: F)
    where
        F: Fn(JobArgs, TaskContext, Arc<DispatcherContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskResult, DispatchError>> + Send + 'static,
    {
        let boxed: BoxedJobHandler =
            Box::new(move |args, task, ctx| Box::pin(handler(args, task, ctx)));
        self.handlers.insert(job_name.into(), boxed);
    }

    /// Execute a job by name.
    pub async fn execute(
        &self,
        job_name: &str,
        args: JobArgs,
        task: TaskContext,
        ctx: Arc<DispatcherContext>,
    ) -> Result<TaskResult, DispatchError> {
        let handler = self
            .handlers
            .get(job_name)
            .ok_or_else(|| DispatchError::Other(anyhow!("unknown job name: {job_name}")))?;
        handler(args, task, ctx).await
    }

    pub fn is_registered(&self, job_name: &str) -> bool {
        self.handlers.contains_key(job_name)
    }

    pub fn registered_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TestBroker;
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn test_ctx() -> Arc<DispatcherContext> {
        Arc::new(DispatcherContext::from_store(
            Arc::new(MemoryStore::new()),
            Arc::new(TestBroker::new()),
        ))
    }

    #[test]
    fn register_and_check() {
        let mut registry = JobRegistry::new();
        registry.register("noop", |_args, _task, _ctx| async move {
            Ok(TaskResult::new())
        });

        assert!(registry.is_registered("noop"));
        assert!(!registry.is_registered("other"));
    }

    #[tokio::test]
    async fn execute_runs_the_handler() {
        let mut registry = JobRegistry::new();
        registry.register("echo", |args, _task, _ctx| async move {
            Ok(TaskResult {
                result: args.args.into_iter().next(),
                ..TaskResult::default()
            })
        });

        let task = TaskContext::new(Uuid::new_v4(), "w1", CancellationToken::new());
        let args = JobArgs::positional(vec!["hello".into()]);
        let result = registry
            .execute("echo", args, task, test_ctx())
            .await
            .unwrap();
        assert_eq!(result.result.as_ref().and_then(|v| v.as_str()), Some("hello"));
    }

    #[tokio::test]
    async fn unknown_job_name_errors() {
        let registry = JobRegistry::new();
        let task = TaskContext::new(Uuid::new_v4(), "w1", CancellationToken::new());
        let err = registry
            .execute("missing", JobArgs::new(), task, test_ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown job name"));
    }
}
