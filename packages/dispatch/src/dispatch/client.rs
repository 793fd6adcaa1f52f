//! Producer-side dispatch API.
//!
//! `apply_async_with_reservation` promises to dispatch the job later, once
//! the resource manager has placed it; the status row exists before this
//! returns so callers can poll immediately.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::debug;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::context::DispatcherContext;
use super::messages::{JobEnvelope, ReservationRequest, WorkerMessage};
use super::RESOURCE_MANAGER_QUEUE;
use crate::common::{tags, JobArgs};
use crate::store::TaskStatus;

/// Options accepted by every dispatch call.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct DispatchOptions {
    /// Opaque search tags placed on the status row.
    #[builder(default)]
    pub tags: Vec<String>,
    /// Groups related tasks for querying.
    #[builder(default, setter(strip_option))]
    pub group_id: Option<Uuid>,
    /// Links the task back to the schedule entry that spawned it.
    #[builder(default, setter(strip_option))]
    pub schedule_id: Option<Uuid>,
}

/// An asynchronous reference to a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: Uuid,
}

impl TaskHandle {
    /// Poll the current status row.
    pub async fn status(&self, ctx: &DispatcherContext) -> Result<Option<TaskStatus>> {
        ctx.tasks.get(self.task_id).await
    }
}

/// Client for submitting work into the dispatch pipeline.
pub struct DispatchClient {
    ctx: Arc<DispatcherContext>,
}

impl DispatchClient {
    pub fn new(ctx: Arc<DispatcherContext>) -> Self {
        Self { ctx }
    }

    /// Dispatch a job that must exclusively hold one named resource.
    ///
    /// The resource id is namespaced as `type:id` so two kinds of resource
    /// sharing an id never block each other.
    pub async fn apply_async_with_reservation(
        &self,
        job_name: &str,
        resource_type: &str,
        resource_id: &str,
        args: JobArgs,
        options: DispatchOptions,
    ) -> Result<TaskHandle> {
        let resource = tags::resource_tag(resource_type, resource_id);
        self.submit_reserved(job_name, vec![resource], args, options)
            .await
    }

    /// Dispatch a job that must exclusively hold every resource in the list.
    pub async fn apply_async_with_reservation_list(
        &self,
        job_name: &str,
        resources: &[(&str, &str)],
        args: JobArgs,
        options: DispatchOptions,
    ) -> Result<TaskHandle> {
        let resource_ids = resources
            .iter()
            .map(|(rtype, rid)| tags::resource_tag(rtype, rid))
            .collect();
        self.submit_reserved(job_name, resource_ids, args, options)
            .await
    }

    async fn submit_reserved(
        &self,
        job_name: &str,
        resource_ids: Vec<String>,
        args: JobArgs,
        options: DispatchOptions,
    ) -> Result<TaskHandle> {
        let task_id = Uuid::new_v4();

        // The status row must exist before the request is published; callers
        // poll right after this returns, and the worker may beat them to it.
        let status = TaskStatus::waiting(task_id, job_name, options.tags, options.group_id);
        self.ctx.tasks.upsert_waiting(&status).await?;

        let request = if resource_ids.len() == 1 {
            ReservationRequest::Single {
                job_name: job_name.to_string(),
                task_id,
                resource_id: resource_ids.into_iter().next().expect("one resource"),
                args,
                schedule_id: options.schedule_id,
            }
        } else {
            ReservationRequest::Multi {
                job_name: job_name.to_string(),
                task_id,
                resource_ids,
                args,
                schedule_id: options.schedule_id,
            }
        };
        let payload = serde_json::to_vec(&request).context("failed to encode request")?;

        if let Err(err) = self
            .ctx
            .broker
            .publish(RESOURCE_MANAGER_QUEUE, payload.into())
            .await
        {
            self.ctx.tasks.mark_error_if_not_terminal(task_id).await?;
            return Err(err);
        }

        debug!(task_id = %task_id, job_name = %job_name, "queued reservation request");
        Ok(TaskHandle { task_id })
    }

    /// Dispatch straight to a named queue, bypassing reservation.
    ///
    /// Used for work that touches no exclusive resource but should still be
    /// tracked through the status store.
    pub async fn apply_async(
        &self,
        job_name: &str,
        queue: &str,
        args: JobArgs,
        options: DispatchOptions,
    ) -> Result<TaskHandle> {
        let task_id = Uuid::new_v4();
        let envelope = WorkerMessage::Run(JobEnvelope {
            job_name: job_name.to_string(),
            task_id,
            args,
            schedule_id: options.schedule_id,
        });
        let payload = serde_json::to_vec(&envelope).context("failed to encode envelope")?;

        if let Err(err) = self.ctx.broker.publish(queue, payload.into()).await {
            self.ctx.tasks.mark_error_if_not_terminal(task_id).await?;
            return Err(err);
        }

        // Racing with pickup and the completion hooks from here on; the
        // upsert only touches lifecycle fields if it wins the insert.
        let mut status = TaskStatus::waiting(task_id, job_name, options.tags, options.group_id);
        status.worker_name = Some(queue.to_string());
        self.ctx.tasks.upsert_waiting(&status).await?;

        Ok(TaskHandle { task_id })
    }
}
