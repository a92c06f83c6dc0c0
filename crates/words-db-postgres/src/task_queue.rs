//! Durable repost task queue on PostgreSQL.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of worker processes can
//! poll the same queue without handing one task to two of them. Before each
//! claim, tasks whose lease ran out go back to pending with one retry used, or
//! to failed once no retries are left.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx_core::query::Query;
use sqlx_postgres::{PgArguments, PgPool, Postgres};
use time::OffsetDateTime;
use tracing::{debug, instrument};
use uuid::Uuid;

use words_repost::{
    LEASE_EXPIRED, MAX_RETRY_DELAY, QueueError, QueueLimits, QueueStats, RetryPolicy,
    TaskEnvelope, TaskQueue, TaskStatus,
};

use crate::error::queue_err;

const TASK_COLUMNS: &str = "id, name, queue, payload, retries, policy, status, \
     not_before, lease_until, last_error, created_at, updated_at";

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

type TaskRow = (
    Uuid,
    String,
    String,
    Value,
    i32,
    Value,
    String,
    OffsetDateTime,
    Option<OffsetDateTime>,
    Option<String>,
    OffsetDateTime,
    OffsetDateTime,
);

fn envelope_from_row(row: TaskRow) -> Result<TaskEnvelope, QueueError> {
    let (
        id,
        name,
        queue,
        payload,
        retries,
        policy,
        status,
        not_before,
        lease_until,
        last_error,
        created_at,
        updated_at,
    ) = row;

    let policy: RetryPolicy = serde_json::from_value(policy)?;
    Ok(TaskEnvelope {
        id,
        name,
        queue,
        payload,
        retries: u32::try_from(retries).unwrap_or_default(),
        policy,
        status: status.parse()?,
        not_before,
        lease_until,
        last_error,
        created_at,
        updated_at,
    })
}

fn secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// PostgreSQL implementation of [`TaskQueue`].
#[derive(Debug, Clone)]
pub struct PostgresTaskQueue {
    pool: PgPool,
    limits: QueueLimits,
}

impl PostgresTaskQueue {
    /// Creates a queue on an existing pool. The schema must already be migrated.
    pub fn new(pool: PgPool, limits: QueueLimits) -> Self {
        Self { pool, limits }
    }

    /// Charges one retry to every task of `queue` whose lease ran out.
    async fn recover_expired_leases(&self, queue: &str) -> Result<u64, QueueError> {
        let result = sqlx_core::query::query(
            r#"
            UPDATE _repost_tasks
            SET status = CASE WHEN retries < max_retries THEN 'pending' ELSE 'failed' END,
                retries = CASE WHEN retries < max_retries THEN retries + 1 ELSE retries END,
                lease_until = NULL,
                last_error = $2,
                updated_at = NOW()
            WHERE queue = $1 AND status = 'running' AND lease_until <= NOW()
            "#,
        )
        .bind(queue)
        .bind(LEASE_EXPIRED)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            debug!(queue, recovered, "Recovered tasks with expired leases");
        }
        Ok(recovered)
    }

    /// Runs a single-row update, mapping zero affected rows to `NotFound`.
    async fn update_one(&self, id: Uuid, query: PgQuery<'_>) -> Result<(), QueueError> {
        let result = query.execute(&self.pool).await.map_err(queue_err)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    #[instrument(skip(self, envelope), fields(task_id = %envelope.id, task_name = %envelope.name))]
    async fn push(&self, envelope: TaskEnvelope) -> Result<Uuid, QueueError> {
        self.limits.check(&envelope)?;
        let policy = serde_json::to_value(envelope.policy)?;

        sqlx_core::query::query(
            r#"
            INSERT INTO _repost_tasks (
                id, name, queue, payload, retries, max_retries, policy, status,
                not_before, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
        )
        .bind(envelope.id)
        .bind(&envelope.name)
        .bind(&envelope.queue)
        .bind(&envelope.payload)
        .bind(i32::try_from(envelope.retries).unwrap_or(i32::MAX))
        .bind(i32::try_from(envelope.max_retries()).unwrap_or(i32::MAX))
        .bind(policy)
        .bind(envelope.status.as_str())
        .bind(envelope.not_before)
        .bind(envelope.created_at)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        debug!(queue = %envelope.queue, "Task enqueued");
        Ok(envelope.id)
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<TaskEnvelope>, QueueError> {
        self.recover_expired_leases(queue).await?;

        let rows: Vec<TaskRow> = sqlx_core::query_as::query_as(&format!(
            r#"
            UPDATE _repost_tasks
            SET status = 'running',
                lease_until = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM _repost_tasks
                WHERE queue = $1 AND status = 'pending' AND not_before <= NOW()
                ORDER BY not_before ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(secs(lease))
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)?;

        let mut tasks = rows
            .into_iter()
            .map(envelope_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order.
        tasks.sort_by_key(|t| (t.not_before, t.created_at));
        Ok(tasks)
    }

    #[instrument(skip(self))]
    async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        self.update_one(
            id,
            sqlx_core::query::query(
                "UPDATE _repost_tasks SET status = 'completed', lease_until = NULL, \
                 updated_at = NOW() WHERE id = $1",
            )
            .bind(id),
        )
        .await
    }

    #[instrument(skip(self, error))]
    async fn retry(&self, id: Uuid, delay: Duration, error: &str) -> Result<(), QueueError> {
        self.update_one(
            id,
            sqlx_core::query::query(
                "UPDATE _repost_tasks SET status = 'pending', retries = retries + 1, \
                 not_before = NOW() + make_interval(secs => $2), lease_until = NULL, \
                 last_error = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(secs(delay.min(MAX_RETRY_DELAY)))
            .bind(error),
        )
        .await
    }

    #[instrument(skip(self, error))]
    async fn fail(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        self.update_one(
            id,
            sqlx_core::query::query(
                "UPDATE _repost_tasks SET status = 'failed', lease_until = NULL, \
                 last_error = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(error),
        )
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskEnvelope>, QueueError> {
        let row: Option<TaskRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM _repost_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_err)?;

        row.map(envelope_from_row).transpose()
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> = sqlx_core::query_as::query_as(
            "SELECT status, COUNT(*) FROM _repost_tasks WHERE queue = $1 GROUP BY status",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::Running => stats.running = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    async fn list_failed(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<TaskEnvelope>, QueueError> {
        let rows: Vec<TaskRow> = sqlx_core::query_as::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM _repost_tasks \
             WHERE queue = $1 AND status = 'failed' \
             ORDER BY updated_at DESC LIMIT $2"
        ))
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)?;

        rows.into_iter().map(envelope_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn restart_failed(&self, id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx_core::query::query(
            "UPDATE _repost_tasks SET status = 'pending', retries = 0, not_before = NOW(), \
             last_error = NULL, updated_at = NOW() WHERE id = $1 AND status = 'failed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn purge_finished(&self, older_than: Duration) -> Result<u64, QueueError> {
        let result = sqlx_core::query::query(
            "DELETE FROM _repost_tasks WHERE status IN ('completed', 'failed') \
             AND updated_at < NOW() - make_interval(secs => $1)",
        )
        .bind(secs(older_than))
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted, "Purged finished tasks");
        }
        Ok(deleted)
    }
}
