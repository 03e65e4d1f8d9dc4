//! Outcome accounting: one append-only record per event that reaches a
//! terminal state.
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

pub const OUTCOMES_RECORDED: &str = "store_outcomes_total";

#[derive(Error, Debug)]
pub enum OutcomeError {
    #[error("failed to record outcome: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Filtered,
    RateLimited,
    Invalid,
    Abuse,
}

impl Outcome {
    /// Stable integer code, used on the wire and in storage.
    pub fn code(&self) -> i16 {
        match self {
            Outcome::Accepted => 0,
            Outcome::Filtered => 1,
            Outcome::RateLimited => 2,
            Outcome::Invalid => 3,
            Outcome::Abuse => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Filtered => "filtered",
            Outcome::RateLimited => "rate_limited",
            Outcome::Invalid => "invalid",
            Outcome::Abuse => "abuse",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub org_id: i64,
    pub project_id: i64,
    pub key_id: Option<i64>,
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event_id: Option<String>,
}

#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record(&self, outcome: OutcomeRecord) -> Result<(), OutcomeError>;
}

/// Count the outcome and hand it to `sink`.
pub async fn track_outcome(
    sink: &dyn OutcomeSink,
    outcome: OutcomeRecord,
) -> Result<(), OutcomeError> {
    metrics::counter!(OUTCOMES_RECORDED, "outcome" => outcome.outcome.as_str()).increment(1);
    sink.record(outcome).await
}

/// Writes outcomes to the log only.
pub struct LogOutcomeSink;

#[async_trait]
impl OutcomeSink for LogOutcomeSink {
    async fn record(&self, outcome: OutcomeRecord) -> Result<(), OutcomeError> {
        info!(
            org_id = outcome.org_id,
            project_id = outcome.project_id,
            key_id = outcome.key_id,
            outcome = %outcome.outcome,
            reason = outcome.reason.as_deref(),
            event_id = outcome.event_id.as_deref(),
            "outcome"
        );
        Ok(())
    }
}

pub struct PgOutcomeSink {
    pool: PgPool,
}

impl PgOutcomeSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutcomeSink for PgOutcomeSink {
    async fn record(&self, outcome: OutcomeRecord) -> Result<(), OutcomeError> {
        sqlx::query(
            r#"
INSERT INTO store_outcomes
    (org_id, project_id, key_id, outcome, reason, timestamp, event_id)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(outcome.org_id)
        .bind(outcome.project_id)
        .bind(outcome.key_id)
        .bind(outcome.outcome.code())
        .bind(outcome.reason)
        .bind(outcome.timestamp)
        .bind(outcome.event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Keeps outcomes in memory so they can be inspected.
#[derive(Default)]
pub struct MemoryOutcomeSink {
    records: Mutex<Vec<OutcomeRecord>>,
}

impl MemoryOutcomeSink {
    pub fn records(&self) -> Vec<OutcomeRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl OutcomeSink for MemoryOutcomeSink {
    async fn record(&self, outcome: OutcomeRecord) -> Result<(), OutcomeError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_serialize_as_codes() {
        let record = OutcomeRecord {
            org_id: 1,
            project_id: 2,
            key_id: None,
            outcome: Outcome::Filtered,
            reason: Some("discarded-hash".to_owned()),
            timestamp: Utc::now(),
            event_id: Some("abc".to_owned()),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["outcome"], 1);
        assert_eq!(value["reason"], "discarded-hash");
        assert_eq!(serde_json::to_value(Outcome::Abuse).unwrap(), 4);
    }

    #[tokio::test]
    async fn memory_sink_keeps_records_in_order() {
        let sink = MemoryOutcomeSink::default();
        for outcome in [Outcome::Accepted, Outcome::RateLimited] {
            track_outcome(
                &sink,
                OutcomeRecord {
                    org_id: 1,
                    project_id: 2,
                    key_id: Some(3),
                    outcome,
                    reason: None,
                    timestamp: Utc::now(),
                    event_id: None,
                },
            )
            .await
            .unwrap();
        }

        let outcomes: Vec<Outcome> = sink.records().iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Accepted, Outcome::RateLimited]);
    }
}
