//! The pipeline's task catalogue, the scheduler that enqueues stage tasks, and
//! the dispatcher that runs a dequeued task.
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use store_common::queue::{NewTask, Task, TaskQueue};
use store_common::retry::RetryPolicy;
use tracing::debug;
use uuid::Uuid;

use crate::app_context::AppContext;
use crate::error::StoreError;
use crate::metric_consts::TASKS_RETRIED;
use crate::payload::{Payload, ProjectId};
use crate::stages::{preprocess_event, process_event, save_event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    PreprocessEvent,
    PreprocessEventFromReprocessing,
    ProcessEvent,
    ProcessEventFromReprocessing,
    RetryProcessEvent,
    SaveEvent,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::PreprocessEvent,
        TaskKind::PreprocessEventFromReprocessing,
        TaskKind::ProcessEvent,
        TaskKind::ProcessEventFromReprocessing,
        TaskKind::RetryProcessEvent,
        TaskKind::SaveEvent,
    ];

    pub fn preprocess(from_reprocessing: bool) -> Self {
        if from_reprocessing {
            TaskKind::PreprocessEventFromReprocessing
        } else {
            TaskKind::PreprocessEvent
        }
    }

    pub fn process(from_reprocessing: bool) -> Self {
        if from_reprocessing {
            TaskKind::ProcessEventFromReprocessing
        } else {
            TaskKind::ProcessEvent
        }
    }

    pub fn is_process(&self) -> bool {
        matches!(
            self,
            TaskKind::ProcessEvent | TaskKind::ProcessEventFromReprocessing
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::PreprocessEvent => "store.preprocess_event",
            TaskKind::PreprocessEventFromReprocessing => "store.preprocess_event_from_reprocessing",
            TaskKind::ProcessEvent => "store.process_event",
            TaskKind::ProcessEventFromReprocessing => "store.process_event_from_reprocessing",
            TaskKind::RetryProcessEvent => "store.retry_process_event",
            TaskKind::SaveEvent => "store.save_event",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            TaskKind::PreprocessEvent => "events.preprocess_event",
            TaskKind::PreprocessEventFromReprocessing => "events.reprocessing.preprocess_event",
            TaskKind::ProcessEvent => "events.process_event",
            TaskKind::ProcessEventFromReprocessing => "events.reprocessing.process_event",
            TaskKind::RetryProcessEvent => "sleep",
            TaskKind::SaveEvent => "events.save_event",
        }
    }

    /// Past this the task keeps running but is logged as slow.
    pub fn soft_time_limit(&self) -> Option<Duration> {
        match self {
            TaskKind::RetryProcessEvent => Some(Duration::from_secs(300)),
            TaskKind::SaveEvent => None,
            _ => Some(Duration::from_secs(60)),
        }
    }

    /// Past this the task is cancelled and left for redelivery.
    pub fn time_limit(&self) -> Option<Duration> {
        match self {
            TaskKind::RetryProcessEvent => Some(Duration::from_secs(305)),
            TaskKind::SaveEvent => None,
            _ => Some(Duration::from_secs(65)),
        }
    }
}

impl FromStr for TaskKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| StoreError::UnknownTask(s.to_owned()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessArgs {
    pub cache_key: String,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub event_id: Option<String>,
    /// Inline payload, for direct invocation. Takes precedence over the cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryProcessArgs {
    pub process_task_name: String,
    pub task_kwargs: ProcessArgs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

/// The cache key an event's payload is stored under between stages.
pub fn cache_key_for_event(project_id: ProjectId, event_id: &str) -> String {
    format!("e:{event_id}:{project_id}")
}

/// Enqueues stage tasks on their queues.
pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    retry_policy: RetryPolicy,
    default_time_limit: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        retry_policy: RetryPolicy,
        default_time_limit: Duration,
    ) -> Self {
        Self {
            queue,
            retry_policy,
            default_time_limit,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    async fn submit<A: Serialize>(
        &self,
        kind: TaskKind,
        queue: &str,
        args: &A,
        countdown: Option<Duration>,
    ) -> Result<Uuid, StoreError> {
        let args = serde_json::to_value(args).map_err(|error| StoreError::InvalidTaskArgs {
            task: kind.name().to_owned(),
            error,
        })?;

        let mut task = NewTask::new(kind.name(), queue, args)
            .time_limit(kind.time_limit().unwrap_or(self.default_time_limit));
        if let Some(countdown) = countdown {
            task = task.countdown(countdown);
        }

        let id = self.queue.enqueue(task).await?;
        debug!(task = kind.name(), queue, %id, "task submitted");
        Ok(id)
    }

    pub async fn submit_preprocess(
        &self,
        from_reprocessing: bool,
        args: PreprocessArgs,
    ) -> Result<Uuid, StoreError> {
        let kind = TaskKind::preprocess(from_reprocessing);
        self.submit(kind, kind.queue(), &args, None).await
    }

    pub async fn submit_process(
        &self,
        from_reprocessing: bool,
        args: ProcessArgs,
    ) -> Result<Uuid, StoreError> {
        let kind = TaskKind::process(from_reprocessing);
        self.submit(kind, kind.queue(), &args, None).await
    }

    /// Park a process task on the retry queue until `countdown` expires.
    pub async fn submit_retry_process(
        &self,
        process_task: TaskKind,
        args: ProcessArgs,
        countdown: Duration,
    ) -> Result<Uuid, StoreError> {
        let kind = TaskKind::RetryProcessEvent;
        let queue = self.retry_policy.retry_queue(kind.queue()).to_owned();
        let countdown = self.retry_policy.retry_interval(countdown);
        let args = RetryProcessArgs {
            process_task_name: process_task.name().to_owned(),
            task_kwargs: args,
        };

        metrics::counter!(TASKS_RETRIED, "queue" => queue.clone()).increment(1);
        self.submit(kind, &queue, &args, Some(countdown)).await
    }

    pub async fn submit_save(&self, args: SaveArgs) -> Result<Uuid, StoreError> {
        let kind = TaskKind::SaveEvent;
        self.submit(kind, kind.queue(), &args, None).await
    }
}

fn parse_args<A: DeserializeOwned>(task: &Task) -> Result<A, StoreError> {
    serde_json::from_value(task.args.clone()).map_err(|error| StoreError::InvalidTaskArgs {
        task: task.name.clone(),
        error,
    })
}

/// Run a dequeued task to completion.
pub async fn run_task(context: &AppContext, task: &Task) -> Result<(), StoreError> {
    match task.name.parse::<TaskKind>()? {
        TaskKind::PreprocessEvent => preprocess_event(context, parse_args(task)?, false).await,
        TaskKind::PreprocessEventFromReprocessing => {
            preprocess_event(context, parse_args(task)?, true).await
        }
        TaskKind::ProcessEvent => process_event(context, parse_args(task)?, false).await,
        TaskKind::ProcessEventFromReprocessing => {
            process_event(context, parse_args(task)?, true).await
        }
        TaskKind::RetryProcessEvent => {
            let args: RetryProcessArgs = parse_args(task)?;
            let process_task = args.process_task_name.parse::<TaskKind>()?;
            if !process_task.is_process() {
                return Err(StoreError::UnknownTask(args.process_task_name));
            }
            let from_reprocessing = process_task == TaskKind::ProcessEventFromReprocessing;
            context
                .scheduler
                .submit_process(from_reprocessing, args.task_kwargs)
                .await?;
            Ok(())
        }
        TaskKind::SaveEvent => save_event(context, parse_args(task)?).await,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use store_common::queue::MemoryTaskQueue;

    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.name().parse::<TaskKind>().unwrap(), kind);
        }
        assert!(matches!(
            "store.nope".parse::<TaskKind>(),
            Err(StoreError::UnknownTask(name)) if name == "store.nope"
        ));
    }

    #[test]
    fn limits_match_the_catalogue() {
        assert_eq!(
            TaskKind::ProcessEvent.time_limit(),
            Some(Duration::from_secs(65))
        );
        assert_eq!(
            TaskKind::RetryProcessEvent.soft_time_limit(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(TaskKind::SaveEvent.time_limit(), None);
        assert_eq!(TaskKind::RetryProcessEvent.queue(), "sleep");
        assert_eq!(
            TaskKind::process(true).queue(),
            "events.reprocessing.process_event"
        );
    }

    #[test]
    fn save_args_accept_missing_fields() {
        let args: SaveArgs = serde_json::from_value(json!({"cache_key": "e:1:2"})).unwrap();
        assert_eq!(args.cache_key.as_deref(), Some("e:1:2"));
        assert_eq!(args.data, None);
        assert_eq!(args.project_id, None);
    }

    #[tokio::test]
    async fn retries_are_parked_with_a_countdown() {
        let queue = Arc::new(MemoryTaskQueue::default());
        let scheduler = Scheduler::new(queue.clone(), RetryPolicy::default(), Duration::from_secs(65));

        scheduler
            .submit_retry_process(
                TaskKind::ProcessEvent,
                ProcessArgs {
                    cache_key: "e:abc:1".to_owned(),
                    ..Default::default()
                },
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        let parked = queue.pending("sleep");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].name, "store.retry_process_event");
        assert_eq!(parked[0].time_limit, Duration::from_secs(305));
        assert_eq!(
            parked[0].args["process_task_name"],
            json!("store.process_event")
        );
        assert_eq!(parked[0].args["task_kwargs"]["cache_key"], json!("e:abc:1"));
    }

    #[tokio::test]
    async fn save_tasks_use_the_default_limit() {
        let queue = Arc::new(MemoryTaskQueue::default());
        let scheduler = Scheduler::new(queue.clone(), RetryPolicy::default(), Duration::from_secs(90));

        scheduler.submit_save(SaveArgs::default()).await.unwrap();

        let pending = queue.pending("events.save_event");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].time_limit, Duration::from_secs(90));
    }
}
