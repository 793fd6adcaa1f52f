//! Worker runtime: consumes a dedicated inbox and runs job bodies.
//!
//! The inbox is processed strictly in order, which is what makes the
//! trailing release message safe: it can only be handled after the job
//! before it has settled. Parallelism comes from hosting several named
//! runtimes in one process, never from reordering one inbox.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::{DispatcherContext, TaskContext};
use super::messages::{JobEnvelope, WorkerMessage};
use super::registry::SharedJobRegistry;
use super::result::TaskResult;
use super::service::Service;
use crate::broker::ControlEvent;
use crate::common::{DispatchError, ErrorCode, TaskError};
use crate::store::TaskState;

#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    /// Registry name of this worker; also the name of its inbox queue.
    pub worker_name: String,
    /// Root of per-task working directories, cleaned after each run.
    pub work_dir: Option<PathBuf>,
    /// When set, each execution is wrapped in a CPU profiler and a per-task
    /// flamegraph is dumped here.
    pub profiling_dir: Option<PathBuf>,
}

impl WorkerRuntimeConfig {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            work_dir: None,
            profiling_dir: None,
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_profiling_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profiling_dir = Some(dir.into());
        self
    }
}

pub struct WorkerRuntime {
    ctx: Arc<DispatcherContext>,
    registry: SharedJobRegistry,
    config: WorkerRuntimeConfig,
    /// Live executions, for revoke targeting.
    running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl WorkerRuntime {
    pub fn new(
        ctx: Arc<DispatcherContext>,
        registry: SharedJobRegistry,
        config: WorkerRuntimeConfig,
    ) -> Self {
        Self {
            ctx,
            registry,
            config,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.config.worker_name
    }

    /// Handle one `Run` envelope: the pickup/execute/hook cycle.
    async fn process_run(&self, envelope: JobEnvelope) {
        let task_id = envelope.task_id;

        // Cancel-before-start: a status flipped to canceled before pickup
        // means the body never runs. A missing status is a race with the
        // producer and is fine; the upsert below covers it.
        match self.ctx.tasks.get(task_id).await {
            Ok(Some(status)) if status.state == TaskState::Canceled => {
                debug!(task_id = %task_id, "cancel received before pickup, skipping");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to read task status");
                return;
            }
        }

        if let Err(e) = self
            .ctx
            .tasks
            .mark_running(task_id, &self.config.worker_name, Utc::now())
            .await
        {
            error!(task_id = %task_id, error = %e, "failed to record pickup");
            return;
        }

        let cancellation = CancellationToken::new();
        self.running
            .write()
            .await
            .insert(task_id, cancellation.clone());

        let profiler = self.config.profiling_dir.is_some().then(start_profiler).flatten();

        debug!(task_id = %task_id, job = %envelope.job_name, "running task");
        let task_ctx = TaskContext::new(task_id, &self.config.worker_name, cancellation.clone());
        let outcome = tokio::select! {
            outcome = self.registry.execute(
                &envelope.job_name,
                envelope.args.clone(),
                task_ctx,
                self.ctx.clone(),
            ) => outcome,
            _ = cancellation.cancelled() => {
                Err(DispatchError::Other(anyhow::anyhow!(
                    "terminated by revoke request"
                )))
            }
        };

        self.running.write().await.remove(&task_id);

        if let (Some(guard), Some(dir)) = (profiler, &self.config.profiling_dir) {
            dump_profile(guard, dir, task_id);
        }

        match outcome {
            Ok(result) => self.on_success(&envelope, result).await,
            Err(err) => self.on_failure(&envelope, err).await,
        }

        self.clean_working_directory(task_id).await;
    }

    /// Success hook: record the outcome, preserving a terminal state written
    /// by a racing cancel.
    async fn on_success(&self, envelope: &JobEnvelope, result: TaskResult) {
        let task_id = envelope.task_id;
        debug!(task_id = %task_id, "task successful");

        let result_value = match result.result.as_ref().map(serde_json::to_value).transpose() {
            Ok(value) => value,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to serialize task result");
                None
            }
        };
        let error_value = result
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok());

        if let Err(e) = self
            .ctx
            .tasks
            .finish_success(
                task_id,
                Utc::now(),
                result_value,
                error_value,
                &result.spawned_tasks,
            )
            .await
        {
            error!(task_id = %task_id, error = %e, "failed to record task success");
        }

        if let Some(schedule_id) = envelope.schedule_id {
            if let Err(e) = self.ctx.schedule_feedback.record_success(schedule_id).await {
                warn!(schedule_id = %schedule_id, error = %e, "failed to reset schedule failures");
            }
        }
    }

    /// Failure hook. Declared-code failures are recorded without a traceback;
    /// everything else keeps its full chain.
    async fn on_failure(&self, envelope: &JobEnvelope, err: DispatchError) {
        let task_id = envelope.task_id;
        let task_error = TaskError::from(&err);

        let traceback = match &err {
            DispatchError::Coded { .. } => {
                info!(task_id = %task_id, error = %err, "task failed");
                None
            }
            DispatchError::Other(inner) => {
                info!(task_id = %task_id, "task failed");
                Some(format!("{inner:?}"))
            }
            other => {
                info!(task_id = %task_id, "task failed");
                Some(other.to_string())
            }
        };

        if let Err(e) = self
            .ctx
            .tasks
            .finish_failure(
                task_id,
                Utc::now(),
                serde_json::to_value(&task_error).unwrap_or(serde_json::Value::Null),
                traceback.as_deref(),
            )
            .await
        {
            error!(task_id = %task_id, error = %e, "failed to record task failure");
        }

        if let Some(schedule_id) = envelope.schedule_id {
            if let Err(e) = self.ctx.schedule_feedback.record_failure(schedule_id).await {
                warn!(schedule_id = %schedule_id, error = %e, "failed to bump schedule failures");
            }
        }
    }

    /// Handle the trailing `Release` message: clear the ledger and announce
    /// the change so parked placements can retry.
    async fn process_release(&self, task_id: Uuid) {
        // Seeing the task still running here should not happen while the job
        // strictly precedes its release; it points at a broker replay or a
        // skipped hook, so shout and record it.
        match self.ctx.tasks.get(task_id).await {
            Ok(Some(status)) if status.state == TaskState::Running => {
                error!(
                    task_id = %task_id,
                    "release found task still running; marking errored"
                );
                let task_error = TaskError::coded(
                    ErrorCode::ReleasedWhileRunning,
                    format!("reservation for task {task_id} released while still running"),
                );
                if let Err(e) = self
                    .ctx
                    .tasks
                    .finish_failure(
                        task_id,
                        Utc::now(),
                        serde_json::to_value(&task_error).unwrap_or(serde_json::Value::Null),
                        None,
                    )
                    .await
                {
                    error!(task_id = %task_id, error = %e, "failed to record release error");
                }
            }
            Ok(_) => {}
            Err(e) => error!(task_id = %task_id, error = %e, "failed to read task status"),
        }

        match self.ctx.ledger.release(task_id).await {
            Ok(removed) => {
                debug!(task_id = %task_id, removed = removed, "released reservations")
            }
            Err(e) => error!(task_id = %task_id, error = %e, "failed to release reservations"),
        }

        if let Err(e) = self
            .ctx
            .broker
            .notify(ControlEvent::Released { task_id })
            .await
        {
            warn!(task_id = %task_id, error = %e, "failed to announce release");
        }
    }

    async fn clean_working_directory(&self, task_id: Uuid) {
        let Some(root) = &self.config.work_dir else {
            return;
        };
        let dir = root.join(task_id.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(task_id = %task_id, "removed working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "failed to remove working directory"),
        }
    }
}

fn start_profiler() -> Option<pprof::ProfilerGuard<'static>> {
    match pprof::ProfilerGuardBuilder::default().frequency(99).build() {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!(error = %e, "failed to start profiler");
            None
        }
    }
}

fn dump_profile(guard: pprof::ProfilerGuard<'_>, dir: &Path, task_id: Uuid) {
    let write = || -> Result<()> {
        std::fs::create_dir_all(dir).context("failed to create profiling directory")?;
        let path = dir.join(format!("{task_id}.svg"));
        let report = guard.report().build().context("failed to build profile")?;
        let file = std::fs::File::create(&path).context("failed to create profile file")?;
        report
            .flamegraph(file)
            .context("failed to write flamegraph")?;
        Ok(())
    };
    if let Err(e) = write() {
        warn!(task_id = %task_id, error = %e, "failed to dump task profile");
    }
}

#[async_trait]
impl Service for WorkerRuntime {
    fn name(&self) -> &'static str {
        "worker-runtime"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(worker = %self.config.worker_name, "worker runtime starting");

        // Revoke fan-out: cancel the matching execution if it is ours.
        let mut control = self.ctx.broker.control_events().await?;
        let running = self.running.clone();
        let revoke_shutdown = shutdown.clone();
        let revoker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = revoke_shutdown.cancelled() => break,
                    event = control.next() => match event {
                        Some(ControlEvent::Revoke { task_id }) => {
                            if let Some(token) = running.read().await.get(&task_id) {
                                info!(task_id = %task_id, "revoking running task");
                                token.cancel();
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        });

        let mut inbox = self.ctx.broker.consume(&self.config.worker_name).await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = inbox.next() => {
                    let Some(delivery) = delivery else { break };
                    match serde_json::from_slice::<WorkerMessage>(&delivery.payload) {
                        Ok(WorkerMessage::Run(envelope)) => self.process_run(envelope).await,
                        Ok(WorkerMessage::Release { task_id }) => {
                            self.process_release(task_id).await
                        }
                        Err(e) => warn!(error = %e, "discarding malformed inbox message"),
                    }
                    delivery.ack().await?;
                }
            }
        }

        revoker.abort();
        info!(worker = %self.config.worker_name, "worker runtime stopped");
        Ok(())
    }
}
