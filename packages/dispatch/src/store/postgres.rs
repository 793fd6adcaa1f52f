//! PostgreSQL implementation of the storage traits.
//!
//! All writes that interleave across processes are single conditional
//! statements so the database is the arbiter: set-on-insert upserts via
//! `ON CONFLICT`, terminal-state guards via `CASE`/`WHERE state NOT IN`,
//! stale-lease takeover via a guarded upsert.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::reservation::ReservedResource;
use super::task::{TaskState, TaskStatus};
use super::worker::Worker;
use super::{LeaseStore, ReservationLedger, TaskStore, WorkerRegistry};

const TASK_COLUMNS: &str = "task_id, task_type, state, worker_name, tags, group_id, \
     start_time, finish_time, result, error, traceback, spawned_tasks";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

#[async_trait]
impl TaskStore for PgStore {
    async fn upsert_waiting(&self, status: &TaskStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_statuses (
                task_id, task_type, state, worker_name, tags, group_id,
                start_time, finish_time, result, error, traceback, spawned_tasks
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (task_id) DO UPDATE SET
                task_type = EXCLUDED.task_type,
                tags = EXCLUDED.tags,
                group_id = EXCLUDED.group_id
            "#,
        )
        .bind(status.task_id)
        .bind(&status.task_type)
        .bind(status.state)
        .bind(&status.worker_name)
        .bind(&status.tags)
        .bind(status.group_id)
        .bind(status.start_time)
        .bind(status.finish_time)
        .bind(&status.result)
        .bind(&status.error)
        .bind(&status.traceback)
        .bind(&status.spawned_tasks)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_name: &str,
        start_time: DateTime<Utc>,
    ) -> Result<()> {
        let upsert = || {
            sqlx::query(
                r#"
                INSERT INTO task_statuses (task_id, task_type, state, worker_name, tags, start_time, spawned_tasks)
                VALUES ($1, '', $2, $3, '{}', $4, '{}')
                ON CONFLICT (task_id) DO UPDATE SET
                    start_time = EXCLUDED.start_time,
                    worker_name = EXCLUDED.worker_name,
                    state = CASE
                        WHEN task_statuses.state = 'waiting' THEN 'running'::task_state
                        ELSE task_statuses.state
                    END
                "#,
            )
            .bind(task_id)
            .bind(TaskState::Running)
            .bind(worker_name)
            .bind(start_time)
            .execute(&self.pool)
        };

        // A concurrent insert can still collide with the upsert; retry the
        // write once before surfacing.
        if let Err(err) = upsert().await {
            if !is_unique_violation(&err) {
                return Err(err.into());
            }
            warn!(task_id = %task_id, "pickup upsert collided, retrying once");
            upsert().await?;
        }

        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskStatus>> {
        let status = sqlx::query_as::<_, TaskStatus>(&format!(
            "SELECT {TASK_COLUMNS} FROM task_statuses WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    async fn finish_success(
        &self,
        task_id: Uuid,
        finish_time: DateTime<Utc>,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        spawned_tasks: &[Uuid],
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_statuses SET
                finish_time = $2,
                result = $3,
                error = COALESCE($4, error),
                spawned_tasks = $5,
                state = CASE
                    WHEN state IN ('finished', 'error', 'canceled', 'timed_out', 'skipped')
                        THEN state
                    ELSE 'finished'::task_state
                END
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(finish_time)
        .bind(result)
        .bind(error)
        .bind(spawned_tasks)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_failure(
        &self,
        task_id: Uuid,
        finish_time: DateTime<Utc>,
        error: serde_json::Value,
        traceback: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_statuses SET
                finish_time = $2,
                error = $3,
                traceback = $4,
                state = CASE
                    WHEN state IN ('finished', 'error', 'canceled', 'timed_out', 'skipped')
                        THEN state
                    ELSE 'error'::task_state
                END
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(finish_time)
        .bind(error)
        .bind(traceback)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_if_not_terminal(&self, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_statuses SET state = 'canceled'
            WHERE task_id = $1
              AND state NOT IN ('finished', 'error', 'canceled', 'timed_out', 'skipped')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_error_if_not_terminal(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_statuses SET state = 'error'
            WHERE task_id = $1
              AND state NOT IN ('finished', 'error', 'canceled', 'timed_out', 'skipped')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn incomplete_by_worker(&self, worker_name: &str) -> Result<Vec<TaskStatus>> {
        let statuses = sqlx::query_as::<_, TaskStatus>(&format!(
            "SELECT {TASK_COLUMNS} FROM task_statuses \
             WHERE worker_name = $1 AND state IN ('waiting', 'running')"
        ))
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(statuses)
    }
}

#[async_trait]
impl ReservationLedger for PgStore {
    async fn reserve(
        &self,
        task_id: Uuid,
        worker_name: &str,
        resource_ids: &[String],
    ) -> Result<()> {
        // One transaction: either every row lands or none do. Idempotent per
        // row so a redelivered request does not trip over its own rows.
        let mut tx = self.pool.begin().await?;
        for resource_id in resource_ids {
            sqlx::query(
                r#"
                INSERT INTO reserved_resources (task_id, worker_name, resource_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (task_id, resource_id) DO UPDATE SET
                    worker_name = EXCLUDED.worker_name
                "#,
            )
            .bind(task_id)
            .bind(worker_name)
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn release(&self, task_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM reserved_resources WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn by_resource(&self, resource_id: &str) -> Result<Option<ReservedResource>> {
        let row = sqlx::query_as::<_, ReservedResource>(
            "SELECT task_id, worker_name, resource_id FROM reserved_resources \
             WHERE resource_id = $1 LIMIT 1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn worker_names_for(&self, resource_ids: &[String]) -> Result<HashSet<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT worker_name FROM reserved_resources WHERE resource_id = ANY($1)",
        )
        .bind(resource_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(names.into_iter().collect())
    }

    async fn by_worker(&self, worker_name: &str) -> Result<Vec<ReservedResource>> {
        let rows = sqlx::query_as::<_, ReservedResource>(
            "SELECT task_id, worker_name, resource_id FROM reserved_resources \
             WHERE worker_name = $1",
        )
        .bind(worker_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn all_reserved_worker_names(&self) -> Result<HashSet<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT worker_name FROM reserved_resources",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(names.into_iter().collect())
    }

    async fn delete_by_worker(&self, worker_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM reserved_resources WHERE worker_name = $1")
            .bind(worker_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WorkerRegistry for PgStore {
    async fn online(&self) -> Result<Vec<Worker>> {
        let workers =
            sqlx::query_as::<_, Worker>("SELECT name, last_heartbeat FROM workers")
                .fetch_all(&self.pool)
                .await?;

        Ok(workers)
    }

    async fn record_heartbeat(&self, name: &str, ts: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (name, last_heartbeat)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(name)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
        let workers = sqlx::query_as::<_, Worker>(
            "SELECT name, last_heartbeat FROM workers WHERE last_heartbeat < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(workers)
    }
}

#[async_trait]
impl LeaseStore for PgStore {
    async fn try_acquire(
        &self,
        role: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO singleton_locks (role, holder, last_heartbeat)
            VALUES ($1, $2, $3)
            ON CONFLICT (role) DO UPDATE SET
                holder = EXCLUDED.holder,
                last_heartbeat = EXCLUDED.last_heartbeat
            WHERE singleton_locks.holder = EXCLUDED.holder
               OR singleton_locks.last_heartbeat < $4
            "#,
        )
        .bind(role)
        .bind(holder)
        .bind(now)
        .bind(now - ttl)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn renew(&self, role: &str, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE singleton_locks SET last_heartbeat = $3 WHERE role = $1 AND holder = $2",
        )
        .bind(role)
        .bind(holder)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, role: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM singleton_locks WHERE role = $1 AND holder = $2")
            .bind(role)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_by_holder(&self, holder: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM singleton_locks WHERE holder = $1")
            .bind(holder)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
