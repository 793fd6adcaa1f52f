//! In-memory store implementing every storage trait.
//!
//! Mirrors the Postgres semantics (set-on-insert upserts, terminal-state
//! guards, stale-lease takeover) so the dispatch pipeline can be exercised in
//! tests without a database.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::reservation::{Lease, ReservedResource};
use super::task::{TaskState, TaskStatus};
use super::worker::Worker;
use super::{LeaseStore, ReservationLedger, TaskStore, WorkerRegistry};

/// One in-memory instance backs all four collections, like a single database.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, TaskStatus>>,
    reservations: RwLock<Vec<ReservedResource>>,
    workers: RwLock<HashMap<String, Worker>>,
    leases: RwLock<HashMap<String, Lease>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every reservation row, for test assertions.
    pub fn reservation_rows(&self) -> Vec<ReservedResource> {
        self.reservations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Snapshot of every registered worker, for test assertions.
    pub fn worker_rows(&self) -> Vec<Worker> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of every task record, for test assertions.
    pub fn task_rows(&self) -> Vec<TaskStatus> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn upsert_waiting(&self, status: &TaskStatus) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        match tasks.get_mut(&status.task_id) {
            Some(existing) => {
                existing.task_type = status.task_type.clone();
                existing.tags = status.tags.clone();
                existing.group_id = status.group_id;
            }
            None => {
                tasks.insert(status.task_id, status.clone());
            }
        }
        Ok(())
    }

    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_name: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        match tasks.get_mut(&task_id) {
            Some(existing) => {
                existing.start_time = Some(start_time);
                existing.worker_name = Some(worker_name.to_string());
                if existing.state == TaskState::Waiting {
                    existing.state = TaskState::Running;
                }
            }
            None => {
                let mut status = TaskStatus::builder()
                    .task_id(task_id)
                    .task_type(String::new())
                    .state(TaskState::Running)
                    .build();
                status.worker_name = Some(worker_name.to_string());
                status.start_time = Some(start_time);
                tasks.insert(task_id, status);
            }
        }
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskStatus>> {
        Ok(self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .cloned())
    }

    async fn finish_success(
        &self,
        task_id: Uuid,
        finish_time: DateTime<Utc>,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        spawned_tasks: &[Uuid],
    ) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = tasks.get_mut(&task_id) {
            existing.finish_time = Some(finish_time);
            existing.result = result;
            if error.is_some() {
                existing.error = error;
            }
            existing.spawned_tasks = spawned_tasks.to_vec();
            if !existing.state.is_terminal() {
                existing.state = TaskState::Finished;
            }
        }
        Ok(())
    }

    async fn finish_failure(
        &self,
        task_id: Uuid,
        finish_time: DateTime<Utc>,
        error: serde_json::Value,
        traceback: Option<&str>,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = tasks.get_mut(&task_id) {
            existing.finish_time = Some(finish_time);
            existing.error = Some(error);
            existing.traceback = traceback.map(str::to_string);
            if !existing.state.is_terminal() {
                existing.state = TaskState::Error;
            }
        }
        Ok(())
    }

    async fn cancel_if_not_terminal(&self, task_id: Uuid) -> Result<bool> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        match tasks.get_mut(&task_id) {
            Some(existing) if !existing.state.is_terminal() => {
                existing.state = TaskState::Canceled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_error_if_not_terminal(&self, task_id: Uuid) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = tasks.get_mut(&task_id) {
            if !existing.state.is_terminal() {
                existing.state = TaskState::Error;
            }
        }
        Ok(())
    }

    async fn incomplete_by_worker(&self, worker_name: &str) -> Result<Vec<TaskStatus>> {
        Ok(self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| {
                t.state.is_incomplete() && t.worker_name.as_deref() == Some(worker_name)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReservationLedger for MemoryStore {
    async fn reserve(
        &self,
        task_id: Uuid,
        worker_name: &str,
        resource_ids: &[String],
    ) -> Result<()> {
        let mut rows = self.reservations.write().unwrap_or_else(|e| e.into_inner());
        for resource_id in resource_ids {
            // Idempotent per (task_id, resource_id), like the unique index.
            rows.retain(|r| !(r.task_id == task_id && &r.resource_id == resource_id));
            rows.push(ReservedResource::new(task_id, worker_name, resource_id.clone()));
        }
        Ok(())
    }

    async fn release(&self, task_id: Uuid) -> Result<u64> {
        let mut rows = self.reservations.write().unwrap_or_else(|e| e.into_inner());
        let before = rows.len();
        rows.retain(|r| r.task_id != task_id);
        Ok((before - rows.len()) as u64)
    }

    async fn by_resource(&self, resource_id: &str) -> Result<Option<ReservedResource>> {
        Ok(self
            .reservations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.resource_id == resource_id)
            .cloned())
    }

    async fn worker_names_for(&self, resource_ids: &[String]) -> Result<HashSet<String>> {
        Ok(self
            .reservations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| resource_ids.contains(&r.resource_id))
            .map(|r| r.worker_name.clone())
            .collect())
    }

    async fn by_worker(&self, worker_name: &str) -> Result<Vec<ReservedResource>> {
        Ok(self
            .reservations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.worker_name == worker_name)
            .cloned()
            .collect())
    }

    async fn all_reserved_worker_names(&self) -> Result<HashSet<String>> {
        Ok(self
            .reservations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.worker_name.clone())
            .collect())
    }

    async fn delete_by_worker(&self, worker_name: &str) -> Result<u64> {
        let mut rows = self.reservations.write().unwrap_or_else(|e| e.into_inner());
        let before = rows.len();
        rows.retain(|r| r.worker_name != worker_name);
        Ok((before - rows.len()) as u64)
    }
}

#[async_trait]
impl WorkerRegistry for MemoryStore {
    async fn online(&self) -> Result<Vec<Worker>> {
        Ok(self
            .workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn record_heartbeat(&self, name: &str, ts: DateTime<Utc>) -> Result<()> {
        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .and_modify(|w| w.last_heartbeat = ts)
            .or_insert_with(|| Worker::new(name, ts));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        Ok(())
    }

    async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
        Ok(self
            .workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|w| w.last_heartbeat < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn try_acquire(
        &self,
        role: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut leases = self.leases.write().unwrap_or_else(|e| e.into_inner());
        match leases.get_mut(role) {
            Some(lease) if lease.holder == holder || lease.last_heartbeat + ttl < now => {
                lease.holder = holder.to_string();
                lease.last_heartbeat = now;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                leases.insert(
                    role.to_string(),
                    Lease {
                        role: role.to_string(),
                        holder: holder.to_string(),
                        last_heartbeat: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, role: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut leases = self.leases.write().unwrap_or_else(|e| e.into_inner());
        match leases.get_mut(role) {
            Some(lease) if lease.holder == holder => {
                lease.last_heartbeat = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, role: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.write().unwrap_or_else(|e| e.into_inner());
        if leases.get(role).map(|l| l.holder == holder).unwrap_or(false) {
            leases.remove(role);
        }
        Ok(())
    }

    async fn delete_by_holder(&self, holder: &str) -> Result<u64> {
        let mut leases = self.leases.write().unwrap_or_else(|e| e.into_inner());
        let before = leases.len();
        leases.retain(|_, l| l.holder != holder);
        Ok((before - leases.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::roles;

    fn waiting_task(store_name: &str) -> TaskStatus {
        TaskStatus::waiting(Uuid::new_v4(), store_name, vec![], None)
    }

    #[tokio::test]
    async fn upsert_waiting_does_not_clobber_pickup() {
        let store = MemoryStore::new();
        let task_id = Uuid::new_v4();

        // Worker pickup lands before the producer insert is visible.
        store.mark_running(task_id, "w1", Utc::now()).await.unwrap();

        let status = TaskStatus::waiting(task_id, "sync", vec!["t".into()], None);
        store.upsert_waiting(&status).await.unwrap();

        let stored = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Running);
        assert_eq!(stored.task_type, "sync");
        assert_eq!(stored.worker_name.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn mark_running_does_not_resurrect_canceled() {
        let store = MemoryStore::new();
        let status = waiting_task("sync");
        store.upsert_waiting(&status).await.unwrap();
        assert!(store.cancel_if_not_terminal(status.task_id).await.unwrap());

        store
            .mark_running(status.task_id, "w1", Utc::now())
            .await
            .unwrap();

        let stored = store.get(status.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Canceled);
    }

    #[tokio::test]
    async fn success_after_cancel_keeps_canceled() {
        let store = MemoryStore::new();
        let status = waiting_task("sync");
        store.upsert_waiting(&status).await.unwrap();
        store
            .mark_running(status.task_id, "w1", Utc::now())
            .await
            .unwrap();
        assert!(store.cancel_if_not_terminal(status.task_id).await.unwrap());

        store
            .finish_success(status.task_id, Utc::now(), None, None, &[])
            .await
            .unwrap();

        let stored = store.get(status.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Canceled);
        assert!(stored.finish_time.is_some());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal() {
        let store = MemoryStore::new();
        let status = waiting_task("sync");
        store.upsert_waiting(&status).await.unwrap();
        store
            .finish_failure(status.task_id, Utc::now(), serde_json::json!({}), None)
            .await
            .unwrap();

        assert!(!store.cancel_if_not_terminal(status.task_id).await.unwrap());
        let stored = store.get(status.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Error);
    }

    #[tokio::test]
    async fn ledger_queries_see_all_rows_for_a_task() {
        let store = MemoryStore::new();
        let task_id = Uuid::new_v4();
        store
            .reserve(
                task_id,
                "w1",
                &["repository:a".to_string(), "repository:b".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(store.by_worker("w1").await.unwrap().len(), 2);
        assert!(store
            .all_reserved_worker_names()
            .await
            .unwrap()
            .contains("w1"));

        let row = store.by_resource("repository:a").await.unwrap().unwrap();
        assert_eq!(row.worker_name, "w1");
        assert!(store.by_resource("repository:zzz").await.unwrap().is_none());

        let holders = store
            .worker_names_for(&["repository:b".to_string()])
            .await
            .unwrap();
        assert_eq!(holders.len(), 1);

        assert_eq!(
            crate::store::ReservationLedger::release(&store, task_id)
                .await
                .unwrap(),
            2
        );
        assert!(store.reservation_rows().is_empty());
    }

    #[tokio::test]
    async fn stale_workers_filtered_by_cutoff() {
        let store = MemoryStore::new();
        let old = Utc::now() - Duration::seconds(120);
        store.record_heartbeat("w1", old).await.unwrap();
        store.record_heartbeat("w2", Utc::now()).await.unwrap();

        let stale = store.stale(Utc::now() - Duration::seconds(30)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name, "w1");
    }

    #[tokio::test]
    async fn lease_takeover_requires_staleness() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ttl = Duration::seconds(30);

        assert!(store
            .try_acquire(roles::RESOURCE_MANAGER, "resource_manager@h1", now, ttl)
            .await
            .unwrap());
        // A fresh lease cannot be stolen.
        assert!(!store
            .try_acquire(roles::RESOURCE_MANAGER, "resource_manager@h2", now, ttl)
            .await
            .unwrap());
        // A stale one can.
        assert!(store
            .try_acquire(
                roles::RESOURCE_MANAGER,
                "resource_manager@h2",
                now + Duration::seconds(60),
                ttl,
            )
            .await
            .unwrap());
        // The old holder can no longer renew.
        assert!(!store
            .renew(roles::RESOURCE_MANAGER, "resource_manager@h1", now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_by_holder_clears_role_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .try_acquire(roles::SCHEDULER, "scheduler@h1", now, Duration::seconds(30))
            .await
            .unwrap();

        assert_eq!(store.delete_by_holder("scheduler@h1").await.unwrap(), 1);
        assert!(store
            .try_acquire(roles::SCHEDULER, "scheduler@h2", now, Duration::seconds(30))
            .await
            .unwrap());
    }
}
