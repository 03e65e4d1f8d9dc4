use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use super::{NewTask, QueueError, Task, TaskQueue};

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    name: String,
    queue: String,
    args: sqlx::types::Json<serde_json::Value>,
    attempt: i32,
    scheduled_at: DateTime<Utc>,
    time_limit_ms: i64,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            name: row.name,
            queue: row.queue,
            args: row.args.0,
            attempt: row.attempt,
            scheduled_at: row.scheduled_at,
            time_limit: time::Duration::from_millis(u64::try_from(row.time_limit_ms).unwrap_or(0)),
        }
    }
}

/// A queue implemented on top of the `store_tasks` PostgreSQL table.
pub struct PgTaskQueue {
    pool: PgPool,
    lease_grace: time::Duration,
}

impl PgTaskQueue {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self::new_from_pool(pool))
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lease_grace: time::Duration::from_secs(5),
        }
    }
}

fn millis(duration: time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<Uuid, QueueError> {
        let id = Uuid::now_v7();

        sqlx::query(
            r#"
INSERT INTO store_tasks
    (id, name, queue, args, status, attempt, scheduled_at, time_limit_ms, created_at)
VALUES
    ($1, $2, $3, $4, 'available'::task_status, 0, $5, $6, NOW())
            "#,
        )
        .bind(id)
        .bind(&task.name)
        .bind(&task.queue)
        .bind(sqlx::types::Json(&task.args))
        .bind(task.scheduled_at)
        .bind(millis(task.time_limit))
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(id)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Task>, QueueError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
WITH next_task AS (
    SELECT
        id
    FROM
        store_tasks
    WHERE
        queue = $1
        AND (
            (status = 'available' AND scheduled_at <= NOW())
            OR (status = 'running' AND lease_until <= NOW())
        )
    ORDER BY
        scheduled_at, id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    store_tasks
SET
    status = 'running'::task_status,
    attempt = store_tasks.attempt + 1,
    started_at = NOW(),
    lease_until = NOW() + (store_tasks.time_limit_ms + $2) * INTERVAL '1 millisecond'
FROM
    next_task
WHERE
    store_tasks.id = next_task.id
RETURNING
    store_tasks.id,
    store_tasks.name,
    store_tasks.queue,
    store_tasks.args,
    store_tasks.attempt,
    store_tasks.scheduled_at,
    store_tasks.time_limit_ms
            "#,
        )
        .bind(queue)
        .bind(millis(self.lease_grace))
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(row.map(Task::from))
    }

    async fn complete(&self, task: &Task) -> Result<(), QueueError> {
        // Failed rows stay behind with their last_error.
        sqlx::query(
            r#"
DELETE FROM
    store_tasks
WHERE
    id = $1
    AND status = 'running'
            "#,
        )
        .bind(task.id)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "DELETE".to_owned(),
            error,
        })?;

        Ok(())
    }

    async fn fail(&self, task: &Task, error: &str) -> Result<(), QueueError> {
        sqlx::query(
            r#"
UPDATE
    store_tasks
SET
    status = 'failed'::task_status,
    finished_at = NOW(),
    lease_until = NULL,
    last_error = $2
WHERE
    id = $1
    AND status = 'running'
            "#,
        )
        .bind(task.id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn count_rows(pool: &PgPool, status: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM store_tasks WHERE status::text = $1")
            .bind(status)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn completed_tasks_are_deleted(db: PgPool) {
        let queue = PgTaskQueue::new_from_pool(db.clone());
        queue
            .enqueue(NewTask::new("save_event", "events", json!({"cache_key": "e:1:1"})))
            .await
            .unwrap();

        let task = queue.dequeue("events").await.unwrap().unwrap();
        assert_eq!(task.attempt, 1);
        queue.complete(&task).await.unwrap();

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM store_tasks")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert!(queue.dequeue("events").await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn failed_tasks_are_kept_with_their_error(db: PgPool) {
        let queue = PgTaskQueue::new_from_pool(db.clone());
        queue
            .enqueue(NewTask::new("bad", "events", json!({})))
            .await
            .unwrap();

        let task = queue.dequeue("events").await.unwrap().unwrap();
        queue.fail(&task, "unknown task name: bad").await.unwrap();

        assert_eq!(count_rows(&db, "failed").await, 1);
        let error: Option<String> = sqlx::query_scalar("SELECT last_error FROM store_tasks")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(error.as_deref(), Some("unknown task name: bad"));
        assert!(queue.dequeue("events").await.unwrap().is_none());
    }
}
