//! # Postgres State Store
//!
//! Durable adapter over sqlx. Records are stored as JSONB documents with the
//! state (or poll mark) mirrored into an indexed column; compare-and-swap is
//! a conditional UPDATE on that column, so coordination is atomic at the
//! database without advisory locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::state::TaskState;

use super::records::{ExternalJobHandle, TaskResult};
use super::StateStore;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS task_results (
    task_id     UUID PRIMARY KEY,
    task_name   TEXT NOT NULL,
    state       TEXT NOT NULL,
    record      JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS task_results_state_idx ON task_results (state);

CREATE TABLE IF NOT EXISTS schedule_marks (
    name          TEXT PRIMARY KEY,
    last_fired_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS external_job_handles (
    task_id         UUID PRIMARY KEY,
    external_job_id TEXT NOT NULL,
    last_polled_at  TIMESTAMPTZ,
    record          JSONB NOT NULL
);
";

/// Postgres-backed state store.
#[derive(Debug, Clone)]
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the store DDL (idempotent).
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn decode_result(row: &sqlx::postgres::PgRow) -> Result<TaskResult> {
        let record: serde_json::Value = row.try_get("record")?;
        Ok(serde_json::from_value(record)?)
    }

    fn decode_handle(row: &sqlx::postgres::PgRow) -> Result<ExternalJobHandle> {
        let record: serde_json::Value = row.try_get("record")?;
        Ok(serde_json::from_value(record)?)
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>> {
        let row = sqlx::query("SELECT record FROM task_results WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode_result).transpose()
    }

    async fn ensure_result(&self, task_id: Uuid, task_name: &str) -> Result<TaskResult> {
        let pending = TaskResult::pending(task_id, task_name);
        sqlx::query(
            "INSERT INTO task_results (task_id, task_name, state, record)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(task_id)
        .bind(task_name)
        .bind(pending.state.to_string())
        .bind(serde_json::to_value(&pending)?)
        .execute(&self.pool)
        .await?;

        self.get_result(task_id)
            .await?
            .ok_or_else(|| WorkerError::store(format!("task result vanished for {task_id}")))
    }

    async fn compare_and_swap_result(
        &self,
        task_id: Uuid,
        expected: TaskState,
        next: &TaskResult,
    ) -> Result<bool> {
        if !expected.can_transition_to(next.state) {
            return Ok(false);
        }
        let updated = sqlx::query(
            "UPDATE task_results
             SET state = $3, record = $4, updated_at = now()
             WHERE task_id = $1 AND state = $2",
        )
        .bind(task_id)
        .bind(expected.to_string())
        .bind(next.state.to_string())
        .bind(serde_json::to_value(next)?)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn scan_results(&self, states: &[TaskState]) -> Result<Vec<TaskResult>> {
        let names: Vec<String> = states.iter().map(ToString::to_string).collect();
        let rows = sqlx::query("SELECT record FROM task_results WHERE state = ANY($1)")
            .bind(&names)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::decode_result).collect()
    }

    async fn schedule_last_fired(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT last_fired_at FROM schedule_marks WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<DateTime<Utc>, _>("last_fired_at"))
            .transpose()?)
    }

    async fn compare_and_swap_schedule(
        &self,
        name: &str,
        expected: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO schedule_marks (name, last_fired_at)
                     VALUES ($1, $2)
                     ON CONFLICT (name) DO NOTHING",
                )
                .bind(name)
                .bind(fired_at)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
            Some(mark) => {
                sqlx::query(
                    "UPDATE schedule_marks
                     SET last_fired_at = $3
                     WHERE name = $1 AND last_fired_at = $2",
                )
                .bind(name)
                .bind(mark)
                .bind(fired_at)
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };
        Ok(affected == 1)
    }

    async fn get_handle(&self, task_id: Uuid) -> Result<Option<ExternalJobHandle>> {
        let row = sqlx::query("SELECT record FROM external_job_handles WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode_handle).transpose()
    }

    async fn put_handle(&self, handle: &ExternalJobHandle) -> Result<()> {
        sqlx::query(
            "INSERT INTO external_job_handles (task_id, external_job_id, last_polled_at, record)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (task_id) DO UPDATE
             SET external_job_id = EXCLUDED.external_job_id,
                 last_polled_at = EXCLUDED.last_polled_at,
                 record = EXCLUDED.record",
        )
        .bind(handle.task_id)
        .bind(&handle.external_job_id)
        .bind(handle.last_polled_at)
        .bind(serde_json::to_value(handle)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_swap_handle(
        &self,
        task_id: Uuid,
        expected_last_polled: Option<DateTime<Utc>>,
        next: &ExternalJobHandle,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE external_job_handles
             SET last_polled_at = $3, record = $4
             WHERE task_id = $1 AND last_polled_at IS NOT DISTINCT FROM $2",
        )
        .bind(task_id)
        .bind(expected_last_polled)
        .bind(next.last_polled_at)
        .bind(serde_json::to_value(next)?)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn delete_handle(&self, task_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM external_job_handles WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_open_handles(&self) -> Result<Vec<ExternalJobHandle>> {
        let rows = sqlx::query(
            "SELECT h.record FROM external_job_handles h
             LEFT JOIN task_results r ON r.task_id = h.task_id
             WHERE r.state IS NULL OR r.state NOT IN ('success', 'failure', 'revoked')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode_handle).collect()
    }

    async fn purge_closed_handles(&self) -> Result<usize> {
        let deleted = sqlx::query(
            "DELETE FROM external_job_handles h
             USING task_results r
             WHERE r.task_id = h.task_id
               AND r.state IN ('success', 'failure', 'revoked')",
        )
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected() as usize)
    }
}
