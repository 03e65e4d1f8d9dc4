//! Durable records written by the pipeline besides the event itself.
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;
use crate::payload::{Payload, ProjectId};

/// The untouched payload of an event that could not be processed, kept so it
/// can be reprocessed later. At most one per (project, event_id).
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub id: i64,
    pub project_id: ProjectId,
    pub event_id: String,
    pub datetime: DateTime<Utc>,
    pub data: Payload,
}

/// A problem reported by an enhancer that blocks processing of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingIssue {
    pub scope: String,
    pub object: String,
    #[serde(rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    NewProcessingIssues,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::NewProcessingIssues => "new_processing_issues",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub project_id: ProjectId,
    pub kind: ActivityKind,
    pub datetime: DateTime<Utc>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub name: String,
    pub file_type: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventAttachment {
    pub event_id: String,
    pub project_id: ProjectId,
    pub name: String,
    pub file_id: i64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Delete the raw event for (project, event_id) and its processing issues.
    async fn delete_raw_event(
        &self,
        project_id: ProjectId,
        event_id: &str,
    ) -> Result<(), StorageError>;

    /// Delete the reprocessing report for (project, event_id), returning
    /// whether one existed.
    async fn delete_reprocessing_report(
        &self,
        project_id: ProjectId,
        event_id: &str,
    ) -> Result<bool, StorageError>;

    async fn create_raw_event(
        &self,
        project_id: ProjectId,
        event_id: &str,
        datetime: DateTime<Utc>,
        data: &Payload,
    ) -> Result<RawEvent, StorageError>;

    async fn record_processing_issue(
        &self,
        raw_event: &RawEvent,
        issue: &ProcessingIssue,
    ) -> Result<(), StorageError>;

    async fn create_activity(&self, activity: &Activity) -> Result<(), StorageError>;

    /// Create an empty file record, returning its id.
    async fn create_file(&self, file: &NewFile) -> Result<i64, StorageError>;

    async fn put_file_contents(&self, file_id: i64, contents: &[u8]) -> Result<(), StorageError>;

    async fn create_event_attachment(
        &self,
        attachment: &EventAttachment,
    ) -> Result<(), StorageError>;
}
