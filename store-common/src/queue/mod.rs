//! Named task queues with delayed delivery and at-least-once semantics.
//!
//! A dequeued task is leased for its time limit plus a grace period. A task
//! that is neither completed nor failed before its lease expires becomes
//! available again, with its attempt counter bumped on the next delivery.
use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod pg;

pub use memory::MemoryTaskQueue;
pub use pg::PgTaskQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid TaskStatus")]
    ParseTaskStatusError(String),
}

/// Available: waiting for its scheduled time or for a worker.
/// Running: leased by a worker.
/// Completed and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "task_status")]
#[sqlx(rename_all = "lowercase")]
pub enum TaskStatus {
    Available,
    Completed,
    Failed,
    Running,
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(TaskStatus::Available),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "running" => Ok(TaskStatus::Running),
            invalid => Err(QueueError::ParseTaskStatusError(invalid.to_owned())),
        }
    }
}

/// A task to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub name: String,
    pub queue: String,
    pub args: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub time_limit: time::Duration,
}

impl NewTask {
    pub fn new(name: &str, queue: &str, args: serde_json::Value) -> Self {
        Self {
            name: name.to_owned(),
            queue: queue.to_owned(),
            args,
            scheduled_at: Utc::now(),
            time_limit: time::Duration::from_secs(60),
        }
    }

    /// Delay delivery by `countdown` from now.
    pub fn countdown(mut self, countdown: time::Duration) -> Self {
        self.scheduled_at = Utc::now() + to_time_delta(countdown);
        self
    }

    pub fn time_limit(mut self, time_limit: time::Duration) -> Self {
        self.time_limit = time_limit;
        self
    }
}

/// A task as delivered to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub queue: String,
    pub args: serde_json::Value,
    /// Number of deliveries so far, including this one.
    pub attempt: i32,
    pub scheduled_at: DateTime<Utc>,
    pub time_limit: time::Duration,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: NewTask) -> Result<Uuid, QueueError>;

    /// Lease the next due task on `queue`, if any.
    async fn dequeue(&self, queue: &str) -> Result<Option<Task>, QueueError>;

    async fn complete(&self, task: &Task) -> Result<(), QueueError>;

    /// Mark a task as permanently failed. It will not be redelivered.
    async fn fail(&self, task: &Task, error: &str) -> Result<(), QueueError>;
}

pub(crate) fn to_time_delta(duration: time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
}
