//! Worker-death recovery.

use tracing::{error, info, warn};

use super::cancel::cancel;
use super::context::DispatcherContext;
use crate::broker::ControlEvent;
use crate::common::DispatchError;
use crate::store::{RESOURCE_MANAGER_WORKER_PREFIX, SCHEDULER_WORKER_PREFIX};

/// Remove a worker and everything it was holding.
///
/// Invoked by the sweeper when heartbeats go missing and by graceful
/// shutdown. The mechanics are identical either way; only the log level
/// differs. Reservations released here unblock placements that were waiting
/// on the dead worker's resources, and every incomplete task assigned to it
/// is canceled without a broker revoke (there is nothing left to revoke).
pub async fn delete_worker(
    ctx: &DispatcherContext,
    name: &str,
    normal_shutdown: bool,
) -> anyhow::Result<()> {
    if normal_shutdown {
        info!(worker = %name, "cleaning up shutdown worker");
    } else {
        error!(worker = %name, "worker is missing; canceling the tasks in its queue");
    }

    ctx.workers.delete(name).await?;

    let released = ctx.ledger.delete_by_worker(name).await?;
    if released > 0 {
        info!(worker = %name, released = released, "dropped reservations held by worker");
        // Wake any placement parked on the freed resources.
        if let Err(e) = ctx
            .broker
            .notify(ControlEvent::Released {
                task_id: uuid::Uuid::nil(),
            })
            .await
        {
            warn!(error = %e, "failed to announce reservation cleanup");
        }
    }

    // A dead singleton also loses its lease so a standby can take over.
    if name.starts_with(RESOURCE_MANAGER_WORKER_PREFIX)
        || name.starts_with(SCHEDULER_WORKER_PREFIX)
    {
        ctx.leases.delete_by_holder(name).await?;
    }

    for status in ctx.tasks.incomplete_by_worker(name).await? {
        match cancel(ctx, status.task_id, false).await {
            Ok(()) => {}
            // Racing cleanup already removed it; nothing to do.
            Err(DispatchError::MissingTask(_)) => {}
            Err(e) => warn!(task_id = %status.task_id, error = %e, "failed to cancel task"),
        }
    }

    Ok(())
}
