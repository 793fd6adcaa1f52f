//! The resource manager: singleton placement and dispatch.
//!
//! Exactly one instance holds the lease at a time and is the sole consumer of
//! the resource-manager queue. For each reservation request it picks a worker
//! ("holder wins" — work on an already-reserved resource collapses onto the
//! holding worker so the ledger alone enforces exclusion), writes the
//! reservation rows, forwards the job to the worker's inbox, and enqueues the
//! release behind it on the same FIFO queue.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::DispatcherContext;
use super::messages::{JobEnvelope, ReservationRequest, WorkerMessage};
use super::service::Service;
use super::RESOURCE_MANAGER_QUEUE;
use crate::broker::ControlEvent;
use crate::common::{DispatchError, JobArgs};
use crate::store::{is_user_worker_name, roles, Worker};

/// Fallback cadence for placement retries; the release notification is the
/// primary wake-up signal and this is the watchdog behind it.
pub const PLACEMENT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    /// Registry name of this instance, e.g. `resource_manager@host1`.
    pub name: String,
    /// How stale the lease heartbeat may get before a standby takes over.
    pub lease_ttl: chrono::Duration,
    /// How often the lease heartbeat is refreshed while idle.
    pub renew_interval: Duration,
    /// Watchdog interval between placement attempts.
    pub placement_retry_interval: Duration,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            name: format!("resource_manager@{}", Uuid::new_v4()),
            lease_ttl: chrono::Duration::seconds(30),
            renew_interval: Duration::from_secs(5),
            placement_retry_interval: PLACEMENT_RETRY_INTERVAL,
        }
    }
}

impl ResourceManagerConfig {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Outcome of one placement attempt over a ledger snapshot.
#[derive(Debug, Clone, PartialEq)]
enum Placement {
    OnWorker(String),
    Wait,
}

/// Pick any online worker that is eligible for user work and holds nothing.
fn unreserved_worker(
    online: &[Worker],
    reserved: &HashSet<String>,
) -> Result<String, DispatchError> {
    online
        .iter()
        .find(|w| is_user_worker_name(&w.name) && !reserved.contains(&w.name))
        .map(|w| w.name.clone())
        .ok_or(DispatchError::NoWorkers)
}

/// Decide placement from a snapshot: the set of workers already holding any
/// requested resource, the online workers, and the reserved worker names.
fn decide_placement(
    holders: &HashSet<String>,
    online: &[Worker],
    reserved: &HashSet<String>,
) -> Placement {
    match holders.len() {
        // Exactly one worker holds some of the requested resources; running
        // there serializes naturally behind the holder's work.
        1 => Placement::OnWorker(holders.iter().next().cloned().expect("one holder")),
        // Nobody holds any of them; any unreserved eligible worker will do.
        // Having none is recovered locally by waiting, never surfaced.
        0 => unreserved_worker(online, reserved)
            .map(Placement::OnWorker)
            .unwrap_or(Placement::Wait),
        // Two or more holders: serving the request now would violate
        // exclusion. Wait for the conflicting jobs to finish.
        _ => Placement::Wait,
    }
}

pub struct ResourceManager {
    ctx: Arc<DispatcherContext>,
    config: ResourceManagerConfig,
    ledger_changed: Arc<Notify>,
}

impl ResourceManager {
    pub fn new(ctx: Arc<DispatcherContext>, config: ResourceManagerConfig) -> Self {
        Self {
            ctx,
            config,
            ledger_changed: Arc::new(Notify::new()),
        }
    }

    /// Block until the lease is ours. Standby instances park here.
    async fn acquire_lease(&self, shutdown: &CancellationToken) -> Result<bool> {
        loop {
            if self
                .ctx
                .leases
                .try_acquire(
                    roles::RESOURCE_MANAGER,
                    &self.config.name,
                    Utc::now(),
                    self.config.lease_ttl,
                )
                .await?
            {
                info!(name = %self.config.name, "resource manager lease acquired");
                return Ok(true);
            }

            debug!(name = %self.config.name, "lease held elsewhere, standing by");
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.config.renew_interval) => {}
            }
        }
    }

    async fn renew_lease(&self) -> Result<()> {
        let renewed = self
            .ctx
            .leases
            .renew(roles::RESOURCE_MANAGER, &self.config.name, Utc::now())
            .await?;
        if !renewed {
            bail!("resource manager lease lost to another instance");
        }
        Ok(())
    }

    /// Loop until a worker is found for the requested resources.
    ///
    /// Not cancellable mid-wait by task cancellation; only shutdown or lease
    /// loss interrupts it, leaving the request unacknowledged for the next
    /// lease holder.
    async fn find_worker(
        &self,
        resource_ids: &[String],
        shutdown: &CancellationToken,
    ) -> Result<String> {
        loop {
            // Single-resource requests take the direct row lookup; a holder
            // wins outright. The list form needs the full holders set.
            let holders = if let [resource_id] = resource_ids {
                match self.ctx.ledger.by_resource(resource_id).await? {
                    Some(row) => return Ok(row.worker_name),
                    None => HashSet::new(),
                }
            } else {
                self.ctx.ledger.worker_names_for(resource_ids).await?
            };
            let online = self.ctx.workers.online().await?;
            let reserved = self.ctx.ledger.all_reserved_worker_names().await?;

            match decide_placement(&holders, &online, &reserved) {
                Placement::OnWorker(name) => return Ok(name),
                Placement::Wait => {
                    debug!(
                        resources = ?resource_ids,
                        holders = holders.len(),
                        "no placement possible yet"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => bail!("shut down while waiting for placement"),
                _ = self.ledger_changed.notified() => {}
                _ = tokio::time::sleep(self.config.placement_retry_interval) => {}
            }

            self.renew_lease().await?;
        }
    }

    async fn dispatch(
        &self,
        job_name: String,
        task_id: Uuid,
        worker_name: &str,
        args: JobArgs,
        schedule_id: Option<Uuid>,
    ) -> Result<()> {
        let envelope = WorkerMessage::Run(JobEnvelope {
            job_name,
            task_id,
            args,
            schedule_id,
        });
        let payload = serde_json::to_vec(&envelope).context("failed to encode envelope")?;
        let run_result = self.ctx.broker.publish(worker_name, payload.into()).await;

        // The release always goes out, even when forwarding the job failed;
        // it trails the job on the same FIFO queue and clears the ledger.
        let release = WorkerMessage::Release { task_id };
        let release_payload =
            serde_json::to_vec(&release).context("failed to encode release")?;
        let release_result = self
            .ctx
            .broker
            .publish(worker_name, release_payload.into())
            .await;

        run_result?;
        release_result?;
        Ok(())
    }

    async fn handle_request(
        &self,
        request: ReservationRequest,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (job_name, task_id, resource_ids, args, schedule_id) = request.into_parts();

        let worker_name = self.find_worker(&resource_ids, shutdown).await?;
        self.ctx
            .ledger
            .reserve(task_id, &worker_name, &resource_ids)
            .await?;

        debug!(
            task_id = %task_id,
            worker = %worker_name,
            resources = ?resource_ids,
            "placed reserved task"
        );

        self.dispatch(job_name, task_id, &worker_name, args, schedule_id)
            .await
    }
}

#[async_trait]
impl Service for ResourceManager {
    fn name(&self) -> &'static str {
        "resource-manager"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        if !self.acquire_lease(&shutdown).await? {
            return Ok(());
        }

        // Release notices wake parked placements; the 250 ms watchdog covers
        // missed notifications.
        let mut control = self.ctx.broker.control_events().await?;
        let ledger_changed = self.ledger_changed.clone();
        let forwarder_shutdown = shutdown.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forwarder_shutdown.cancelled() => break,
                    event = control.next() => match event {
                        Some(ControlEvent::Released { .. }) => ledger_changed.notify_waiters(),
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        });

        let mut requests = self.ctx.broker.consume(RESOURCE_MANAGER_QUEUE).await?;
        let mut renew = tokio::time::interval(self.config.renew_interval);
        renew.tick().await;

        info!(name = %self.config.name, "resource manager consuming requests");

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = renew.tick() => {
                    if let Err(e) = self.renew_lease().await {
                        error!(error = %e, "stopping resource manager");
                        break Err(e);
                    }
                }
                delivery = requests.next() => {
                    let Some(delivery) = delivery else { break Ok(()) };
                    let request: ReservationRequest =
                        match serde_json::from_slice(&delivery.payload) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!(error = %e, "discarding malformed reservation request");
                                delivery.ack().await?;
                                continue;
                            }
                        };

                    let task_id = request.task_id();
                    match self.handle_request(request, &shutdown).await {
                        Ok(()) => delivery.ack().await?,
                        Err(e) => {
                            // Left unacknowledged on purpose: the broker
                            // redelivers to the next lease holder.
                            error!(task_id = %task_id, error = %e, "dispatch aborted");
                            break Err(e);
                        }
                    }
                }
            }
        };

        forwarder.abort();
        self.ctx
            .leases
            .release(roles::RESOURCE_MANAGER, &self.config.name)
            .await?;
        info!(name = %self.config.name, "resource manager stopped");
        result
    }
}
