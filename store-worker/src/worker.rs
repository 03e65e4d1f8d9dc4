use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use store_common::queue::Task;
use tokio::sync;
use tracing::{error, warn};

use crate::app_context::AppContext;
use crate::error::WorkerError;
use crate::metric_consts::{
    TASKS_COMPLETED, TASKS_FAILED, TASKS_TIMED_OUT, TASKS_TOTAL, TASK_DURATION, WORKER_SATURATION,
};
use crate::tasks::{run_task, TaskKind};

/// A worker that polls the pipeline queues and runs stage tasks as they
/// become available.
pub struct StoreWorker {
    /// An identifier for this worker, used in logs.
    name: String,
    context: Arc<AppContext>,
    /// The queues we dequeue from, in rotation.
    queues: Vec<String>,
    /// The interval for polling the queues.
    poll_interval: time::Duration,
    /// Maximum number of concurrent tasks being processed.
    max_concurrent_tasks: usize,
    /// Index of the queue the next poll starts with.
    next_queue: AtomicUsize,
}

impl StoreWorker {
    pub fn new(context: Arc<AppContext>) -> Self {
        let config = &context.config;
        Self {
            name: config.worker_name.clone(),
            queues: config.queues.0.clone(),
            poll_interval: config.poll_interval.0,
            max_concurrent_tasks: config.max_concurrent_tasks.max(1),
            next_queue: AtomicUsize::new(0),
            context,
        }
    }

    /// Dequeue the next due task, trying every queue once. Successive calls
    /// start from successive queues so no queue starves the others.
    async fn next_task(&self) -> Result<Option<Task>, WorkerError> {
        let count = self.queues.len();
        let start = self.next_queue.fetch_add(1, Ordering::Relaxed);

        for offset in 0..count {
            let queue = &self.queues[(start + offset) % count];
            if let Some(task) = self.context.queue.dequeue(queue).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Wait until a task becomes available in one of our queues.
    async fn wait_for_task(&self) -> Result<Task, WorkerError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.context.worker_liveness.report_healthy();

            if let Some(task) = self.next_task().await? {
                return Ok(task);
            }
        }
    }

    /// Run this worker to continuously process any tasks that become available.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_tasks));
        let report_semaphore_utilization = || {
            metrics::gauge!(WORKER_SATURATION).set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_tasks as f64,
            );
        };

        tracing::info!(worker = %self.name, queues = ?self.queues, "worker started");
        loop {
            report_semaphore_utilization();
            // Hold a permit before leasing, so a dequeued task starts right away.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore has been closed");
            let task = self.wait_for_task().await?;

            metrics::counter!(TASKS_TOTAL, "queue" => task.queue.clone()).increment(1);

            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(error) = execute_task(&context, task).await {
                    error!("failed to settle task: {}", error);
                }
                drop(permit);
            });
        }
    }

    /// Run due tasks one after the other until none is left, returning how
    /// many ran.
    pub async fn process_available(&self) -> Result<usize, WorkerError> {
        let mut ran = 0;
        while let Some(task) = self.next_task().await? {
            execute_task(&self.context, task).await?;
            ran += 1;
        }
        Ok(ran)
    }
}

/// Run a task under its time limits and settle it on the queue.
///
/// Successful tasks are completed and fatal errors fail the task for good.
/// Retryable errors and timeouts leave the task leased, so the queue delivers
/// it again once the lease expires, until the retry policy's attempts run out.
pub async fn execute_task(context: &AppContext, task: Task) -> Result<(), WorkerError> {
    let labels = [("queue", task.queue.clone())];
    let soft_limit = task
        .name
        .parse::<TaskKind>()
        .ok()
        .and_then(|kind| kind.soft_time_limit());

    let started = tokio::time::Instant::now();
    let run = run_task(context, &task);
    tokio::pin!(run);

    let result = tokio::time::timeout(task.time_limit, async {
        if let Some(soft_limit) = soft_limit {
            tokio::select! {
                result = &mut run => return result,
                _ = tokio::time::sleep(soft_limit) => {
                    warn!(task = %task.name, id = %task.id, ?soft_limit, "task exceeded its soft time limit");
                }
            }
        }
        (&mut run).await
    })
    .await;

    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(Ok(())) => {
            context.queue.complete(&task).await?;

            metrics::counter!(TASKS_COMPLETED, &labels).increment(1);
            metrics::histogram!(TASK_DURATION, &labels).record(elapsed);
        }
        Ok(Err(error)) => {
            settle_failure(context, &task, &labels, &error.to_string(), error.is_retryable())
                .await?;
        }
        Err(_) => {
            error!(
                task = %task.name,
                id = %task.id,
                time_limit = ?task.time_limit,
                "task timed out"
            );
            metrics::counter!(TASKS_TIMED_OUT, &labels).increment(1);

            let error = format!("time limit of {:?} exceeded", task.time_limit);
            settle_failure(context, &task, &labels, &error, true).await?;
        }
    }

    Ok(())
}

/// Leave a retryable failure leased for redelivery while it has attempts
/// left, fail the task otherwise.
async fn settle_failure(
    context: &AppContext,
    task: &Task,
    labels: &[(&'static str, String)],
    error: &str,
    retryable: bool,
) -> Result<(), WorkerError> {
    let exhausted = context
        .scheduler
        .retry_policy()
        .attempts_exhausted(task.attempt);

    if retryable && !exhausted {
        warn!(
            task = %task.name,
            id = %task.id,
            attempt = task.attempt,
            "task failed, leaving it for redelivery: {}",
            error
        );
        return Ok(());
    }

    error!(
        task = %task.name,
        id = %task.id,
        attempt = task.attempt,
        "task failed: {}",
        error
    );
    context.queue.fail(task, error).await?;

    metrics::counter!(TASKS_FAILED, labels).increment(1);
    Ok(())
}
