//! # Retry
//!
//! `RetryPolicy` decides where and when a stage that asked to be retried runs
//! again, and when an event has been in the pipeline for too long to retry.
use std::time;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Wall time after pipeline entry past which a retry request becomes fatal.
    pub max_processing_time: time::Duration,
    /// Upper bound applied to the delay a plugin asks for.
    pub maximum_interval: Option<time::Duration>,
    /// Queue that parks retries until their countdown expires.
    pub queue: Option<String>,
    /// Deliveries of a failing task before it is failed for good.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn build(max_processing_time: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_processing_time)
    }

    /// The countdown to use for a retry requested with `requested` delay.
    pub fn retry_interval(&self, requested: time::Duration) -> time::Duration {
        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(requested, max_interval),
            None => requested,
        }
    }

    /// Whether an event that entered the pipeline at `start_time` (epoch seconds)
    /// has spent longer than allowed in processing as of `now` (epoch seconds).
    /// Events without a start time never exceed the ceiling.
    pub fn deadline_exceeded(&self, start_time: Option<f64>, now: f64) -> bool {
        match start_time {
            Some(start) => now - start > self.max_processing_time.as_secs_f64(),
            None => false,
        }
    }

    /// Whether a task on its `attempt`th delivery may not be delivered again.
    pub fn attempts_exhausted(&self, attempt: i32) -> bool {
        u32::try_from(attempt).is_ok_and(|attempt| attempt >= self.max_attempts)
    }

    pub fn retry_queue<'s>(&'s self, current_queue: &'s str) -> &'s str {
        if let Some(new_queue) = &self.queue {
            new_queue
        } else {
            current_queue
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    pub max_processing_time: time::Duration,
    pub maximum_interval: Option<time::Duration>,
    pub queue: Option<String>,
    pub max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_processing_time: time::Duration::from_secs(3600),
            maximum_interval: None,
            queue: None,
            max_attempts: 3,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_processing_time: time::Duration) -> Self {
        Self {
            max_processing_time,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn queue(mut self, queue: &str) -> RetryPolicyBuilder {
        self.queue = Some(queue.to_owned());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = max_attempts;
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_processing_time: self.max_processing_time,
            maximum_interval: self.maximum_interval,
            queue: self.queue.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_interval_is_kept() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(
            retry_policy.retry_interval(time::Duration::from_secs(30)),
            time::Duration::from_secs(30)
        );
    }

    #[test]
    fn test_requested_interval_is_clamped() {
        let retry_policy = RetryPolicy::build(time::Duration::from_secs(3600))
            .maximum_interval(time::Duration::from_secs(10))
            .provide();

        assert_eq!(
            retry_policy.retry_interval(time::Duration::from_secs(30)),
            time::Duration::from_secs(10)
        );
        assert_eq!(
            retry_policy.retry_interval(time::Duration::from_secs(5)),
            time::Duration::from_secs(5)
        );
    }

    #[test]
    fn test_deadline() {
        let retry_policy = RetryPolicy::default();
        let now = 1_700_000_000.0;

        assert!(!retry_policy.deadline_exceeded(None, now));
        assert!(!retry_policy.deadline_exceeded(Some(now - 60.0), now));
        assert!(!retry_policy.deadline_exceeded(Some(now - 3600.0), now));
        assert!(retry_policy.deadline_exceeded(Some(now - 3601.0), now));
    }

    #[test]
    fn test_attempts_exhausted() {
        let retry_policy = RetryPolicy::build(time::Duration::from_secs(3600))
            .max_attempts(2)
            .provide();

        assert!(!retry_policy.attempts_exhausted(1));
        assert!(retry_policy.attempts_exhausted(2));
        assert!(retry_policy.attempts_exhausted(3));
        assert!(RetryPolicy::default().attempts_exhausted(3));
    }

    #[test]
    fn test_retry_queue() {
        let retry_policy = RetryPolicy::default();
        assert_eq!(retry_policy.retry_queue("sleep"), "sleep");

        let retry_policy = RetryPolicy::build(time::Duration::from_secs(3600))
            .queue("parked")
            .provide();
        assert_eq!(retry_policy.retry_queue("sleep"), "parked");
    }
}
