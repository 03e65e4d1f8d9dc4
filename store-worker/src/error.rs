use std::time;

use store_common::cache::CacheError;
use store_common::outcomes::OutcomeError;
use store_common::queue::QueueError;
use thiserror::Error;

use crate::payload::ProjectId;

/// Errors raised by the storage collaborators: settings, raw events,
/// files and quotas.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("{kind} {id} does not exist")]
    NotFound { kind: &'static str, id: i64 },
}

/// Outcomes of committing an event that are not a successful save.
#[derive(Error, Debug)]
pub enum CommitError {
    /// Business outcome, not a failure: the event's hash was discarded,
    /// usually because the same event was already stored.
    #[error("event hash discarded")]
    HashDiscarded,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors that end a stage. Contract violations are fatal and must not be
/// retried; infrastructure errors leave the task for redelivery.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("event {event_id:?} spent more than {limit:?} in processing")]
    ProcessingDeadlineExceeded {
        event_id: Option<String>,
        limit: time::Duration,
    },
    #[error("project of event {event_id:?} was changed from {expected} to {found:?} during processing")]
    ProjectMutated {
        event_id: Option<String>,
        expected: ProjectId,
        found: Option<ProjectId>,
    },
    #[error("payload has no valid project id")]
    MissingProject,
    #[error("unknown task name: {0}")]
    UnknownTask(String),
    #[error("invalid arguments for task {task}: {error}")]
    InvalidTaskArgs {
        task: String,
        error: serde_json::Error,
    },
    /// The event was committed, and a later step of the save failed.
    #[error("event {event_id:?} was stored, but saving failed afterwards: {source}")]
    AfterCommit {
        event_id: Option<String>,
        source: Box<StoreError>,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
}

impl StoreError {
    /// Whether running the same task again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Storage(StorageError::NotFound { .. }) => false,
            StoreError::Cache(_)
            | StoreError::Queue(_)
            | StoreError::Storage(_)
            | StoreError::Outcome(_) => true,
            _ => false,
        }
    }
}

/// Errors that stop the worker itself.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_violations_are_not_retryable() {
        assert!(!StoreError::UnknownTask("store.nope".to_owned()).is_retryable());
        assert!(!StoreError::MissingProject.is_retryable());
        assert!(!StoreError::ProcessingDeadlineExceeded {
            event_id: None,
            limit: time::Duration::from_secs(3600),
        }
        .is_retryable());
    }

    #[test]
    fn infrastructure_errors_are_retryable() {
        let error = StoreError::from(StorageError::Database(sqlx::Error::PoolTimedOut));
        assert!(error.is_retryable());

        let error = StoreError::from(StorageError::NotFound {
            kind: "project",
            id: 1,
        });
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "project 1 does not exist");
    }

    #[test]
    fn failures_after_a_commit_are_not_retryable() {
        let source = StoreError::from(StorageError::Database(sqlx::Error::PoolTimedOut));
        assert!(source.is_retryable());

        let error = StoreError::AfterCommit {
            event_id: Some("e1".to_owned()),
            source: Box::new(source),
        };
        assert!(!error.is_retryable());
    }
}
