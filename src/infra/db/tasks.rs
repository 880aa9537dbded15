//! Task queue on a Postgres table.
//!
//! Identity dedup comes from the primary key: `ON CONFLICT DO NOTHING` turns
//! a repeated enqueue into a reported duplicate. Leasing uses
//! `FOR UPDATE SKIP LOCKED` so concurrent consumers never double-lease, and
//! every lease carries an expiry so tasks abandoned by crashed workers become
//! eligible again.

use async_trait::async_trait;

use crate::{
    application::queue::{
        EnqueueOutcome, QueueError, TASK_LEASE_TIMEOUT, TaskQueue, TaskSpec,
    },
    domain::{
        entities::{LeasedTask, TaskSnapshot},
        types::{QueueName, TaskState},
    },
};

use super::PostgresRepositories;

fn map_queue_error(err: sqlx::Error) -> QueueError {
    QueueError::backend(err)
}

#[derive(sqlx::FromRow)]
struct LeasedRow {
    id: String,
    payload: serde_json::Value,
    attempts: i32,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: String,
    state: String,
    attempts: i32,
}

#[async_trait]
impl TaskQueue for PostgresRepositories {
    async fn enqueue(&self, spec: TaskSpec) -> Result<EnqueueOutcome, QueueError> {
        let result = sqlx::query(
            "INSERT INTO pipeline_tasks (id, queue, max_attempts, payload) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&spec.task_id)
        .bind(spec.queue.as_str())
        .bind(spec.max_attempts)
        .bind(&spec.payload)
        .execute(self.pool())
        .await
        .map_err(map_queue_error)?;

        if result.rows_affected() == 1 {
            Ok(EnqueueOutcome::Enqueued)
        } else {
            Ok(EnqueueOutcome::Duplicate)
        }
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<LeasedTask>, QueueError> {
        let row = sqlx::query_as::<_, LeasedRow>(
            "UPDATE pipeline_tasks \
                SET state = 'active', attempts = attempts + 1, \
                    leased_until = now() + make_interval(secs => $2), \
                    updated_at = now() \
              WHERE id = ( \
                    SELECT id FROM pipeline_tasks \
                     WHERE queue = $1 \
                       AND (state = 'pending' \
                            OR (state = 'active' AND leased_until < now())) \
                     ORDER BY enqueued_at \
                     FOR UPDATE SKIP LOCKED \
                     LIMIT 1) \
              RETURNING id, payload, attempts",
        )
        .bind(queue.as_str())
        .bind(TASK_LEASE_TIMEOUT.as_secs_f64())
        .fetch_optional(self.pool())
        .await
        .map_err(map_queue_error)?;

        Ok(row.map(|row| LeasedTask {
            task_id: row.id,
            payload: row.payload,
            attempt: row.attempts,
        }))
    }

    async fn complete(&self, task_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM pipeline_tasks WHERE id = $1")
            .bind(task_id)
            .execute(self.pool())
            .await
            .map_err(map_queue_error)?;
        Ok(())
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE pipeline_tasks \
                SET last_error = $2, \
                    leased_until = NULL, \
                    state = CASE WHEN attempts >= max_attempts \
                                 THEN 'failed' ELSE 'pending' END, \
                    updated_at = now() \
              WHERE id = $1",
        )
        .bind(task_id)
        .bind(error)
        .execute(self.pool())
        .await
        .map_err(map_queue_error)?;
        Ok(())
    }

    async fn find_task(&self, task_id: &str) -> Result<Option<TaskSnapshot>, QueueError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT id, state, attempts FROM pipeline_tasks WHERE id = $1",
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_queue_error)?;

        row.map(|row| {
            let state = TaskState::try_from(row.state.as_str())
                .map_err(|_| QueueError::backend(format!("unknown task state `{}`", row.state)))?;
            Ok(TaskSnapshot {
                task_id: row.id,
                state,
                attempts: row.attempts,
            })
        })
        .transpose()
    }

    async fn retry(&self, task_id: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE pipeline_tasks \
                SET state = 'pending', attempts = 0, last_error = NULL, \
                    leased_until = NULL, updated_at = now() \
              WHERE id = $1 \
                AND (state = 'failed' \
                     OR (state = 'active' AND leased_until < now()))",
        )
        .bind(task_id)
        .execute(self.pool())
        .await
        .map_err(map_queue_error)?;

        Ok(result.rows_affected() == 1)
    }
}
