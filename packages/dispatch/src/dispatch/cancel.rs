//! Task cancellation.

use tracing::{info, warn};
use uuid::Uuid;

use super::context::DispatcherContext;
use crate::broker::ControlEvent;
use crate::common::{tags, DispatchError};
use crate::store::AGENT_WORKER_NAME;

/// Cancel a single task. Spawned children are independent and untouched.
///
/// Idempotent on terminal tasks. When `revoke_task` is set the broker is
/// asked to terminate a running execution; the status flip is a single
/// compare-and-set, so a racing completion hook either loses (and then
/// observes `canceled` and leaves it alone) or wins (and this becomes a
/// no-op).
pub async fn cancel(
    ctx: &DispatcherContext,
    task_id: Uuid,
    revoke_task: bool,
) -> Result<(), DispatchError> {
    let status = ctx
        .tasks
        .get(task_id)
        .await?
        .ok_or(DispatchError::MissingTask(task_id))?;

    if status.state.is_terminal() {
        info!(task_id = %task_id, state = ?status.state, "task already in a completed state");
        return Ok(());
    }

    if status.worker_name.as_deref() == Some(AGENT_WORKER_NAME) {
        // Out-of-band execution on a remote consumer: route the cancel to
        // its agent, nothing to revoke at the broker.
        match tags::consumer_id(&status.tags) {
            Some(consumer_id) => {
                ctx.agent_client.cancel_request(consumer_id, task_id).await?;
            }
            None => warn!(
                task_id = %task_id,
                "agent task has no consumer tag; cannot forward cancellation"
            ),
        }
    } else if revoke_task {
        ctx.broker.notify(ControlEvent::Revoke { task_id }).await?;
    }

    if ctx.tasks.cancel_if_not_terminal(task_id).await? {
        info!(task_id = %task_id, "task canceled");
    }

    Ok(())
}
