use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{to_time_delta, NewTask, QueueError, Task, TaskQueue, TaskStatus};

struct Entry {
    task: Task,
    status: TaskStatus,
    seq: u64,
    lease_until: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_due(&self, queue: &str, now: DateTime<Utc>) -> bool {
        if self.task.queue != queue {
            return false;
        }
        match self.status {
            TaskStatus::Available => self.task.scheduled_at <= now,
            TaskStatus::Running => self.lease_until.is_some_and(|until| until <= now),
            TaskStatus::Completed | TaskStatus::Failed => false,
        }
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    failed: Vec<(Task, String)>,
    next_seq: u64,
}

/// A single-process queue. Delivery order within a queue is by scheduled time,
/// then enqueue order.
pub struct MemoryTaskQueue {
    state: Mutex<State>,
    lease_grace: time::Duration,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new(time::Duration::from_secs(5))
    }
}

impl MemoryTaskQueue {
    pub fn new(lease_grace: time::Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            lease_grace,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tasks on `queue` that are not completed or failed, in delivery order.
    pub fn pending(&self, queue: &str) -> Vec<Task> {
        let state = self.state();
        let mut entries: Vec<&Entry> = state
            .entries
            .values()
            .filter(|entry| entry.task.queue == queue)
            .collect();
        entries.sort_by_key(|entry| (entry.task.scheduled_at, entry.seq));
        entries.into_iter().map(|entry| entry.task.clone()).collect()
    }

    /// Every task that was failed, with the error it was failed with.
    pub fn failed(&self) -> Vec<(Task, String)> {
        self.state().failed.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<Uuid, QueueError> {
        let id = Uuid::now_v7();
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;

        let task = Task {
            id,
            name: task.name,
            queue: task.queue,
            args: task.args,
            attempt: 0,
            scheduled_at: task.scheduled_at,
            time_limit: task.time_limit,
        };
        state.entries.insert(
            id,
            Entry {
                task,
                status: TaskStatus::Available,
                seq,
                lease_until: None,
            },
        );

        Ok(id)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let mut state = self.state();

        let next = state
            .entries
            .values_mut()
            .filter(|entry| entry.is_due(queue, now))
            .min_by_key(|entry| (entry.task.scheduled_at, entry.seq));

        let Some(entry) = next else {
            return Ok(None);
        };

        entry.status = TaskStatus::Running;
        entry.task.attempt += 1;
        entry.lease_until = Some(now + to_time_delta(entry.task.time_limit + self.lease_grace));

        Ok(Some(entry.task.clone()))
    }

    async fn complete(&self, task: &Task) -> Result<(), QueueError> {
        // A redelivered task may complete twice.
        self.state().entries.remove(&task.id);
        Ok(())
    }

    async fn fail(&self, task: &Task, error: &str) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(entry) = state.entries.remove(&task.id) {
            state.failed.push((entry.task, error.to_owned()));
        }
        Ok(())
    }
}
