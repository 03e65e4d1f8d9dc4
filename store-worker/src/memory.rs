//! In-process implementations of the storage collaborators, used by tests and
//! by the worker when it runs without a database.
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::commit::{committed_event_id, EventCommitter, StoredEvent};
use crate::error::{CommitError, StorageError};
use crate::payload::{Payload, ProjectId};
use crate::quotas::Quota;
use crate::settings::{Organization, Project, ProjectKey, SettingsStore};
use crate::storage::{
    Activity, EventAttachment, NewFile, ProcessingIssue, RawEvent, Storage,
};

#[derive(Default)]
struct Inner {
    projects: HashMap<ProjectId, Project>,
    organizations: HashMap<i64, Organization>,
    project_keys: HashMap<i64, ProjectKey>,
    project_options: HashMap<(ProjectId, String), Value>,
    organization_options: HashMap<(i64, String), Value>,
    raw_events: HashMap<(ProjectId, String), RawEvent>,
    processing_issues: Vec<(i64, ProcessingIssue)>,
    reprocessing_reports: HashSet<(ProjectId, String)>,
    activities: Vec<Activity>,
    files: HashMap<i64, (NewFile, Vec<u8>)>,
    attachments: Vec<EventAttachment>,
    events: HashMap<(ProjectId, String), Payload>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_project(&self, project_id: ProjectId, organization_id: i64) {
        let mut inner = self.inner();
        inner.projects.insert(
            project_id,
            Project {
                id: project_id,
                organization_id,
            },
        );
        inner
            .organizations
            .entry(organization_id)
            .or_insert_with(|| Organization {
                id: organization_id,
                features: HashSet::new(),
            });
    }

    pub fn enable_feature(&self, organization_id: i64, feature: &str) {
        let mut inner = self.inner();
        let organization = inner
            .organizations
            .entry(organization_id)
            .or_insert_with(|| Organization {
                id: organization_id,
                features: HashSet::new(),
            });
        organization.features.insert(feature.to_owned());
    }

    pub fn add_project_key(&self, key_id: i64, project_id: ProjectId) {
        self.inner().project_keys.insert(
            key_id,
            ProjectKey {
                id: key_id,
                project_id,
            },
        );
    }

    pub fn set_option(&self, project_id: ProjectId, key: &str, value: Value) {
        self
            .inner()
            .project_options
            .insert((project_id, key.to_owned()), value);
    }

    pub fn option(&self, project_id: ProjectId, key: &str) -> Option<Value> {
        self.inner()
            .project_options
            .get(&(project_id, key.to_owned()))
            .cloned()
    }

    pub fn set_organization_option(&self, org_id: i64, key: &str, value: Value) {
        self
            .inner()
            .organization_options
            .insert((org_id, key.to_owned()), value);
    }

    pub fn add_reprocessing_report(&self, project_id: ProjectId, event_id: &str) {
        self
            .inner()
            .reprocessing_reports
            .insert((project_id, event_id.to_owned()));
    }

    pub fn has_reprocessing_report(&self, project_id: ProjectId, event_id: &str) -> bool {
        self.inner()
            .reprocessing_reports
            .contains(&(project_id, event_id.to_owned()))
    }

    pub fn raw_events(&self) -> Vec<RawEvent> {
        let mut raw_events: Vec<RawEvent> = self.inner().raw_events.values().cloned().collect();
        raw_events.sort_by_key(|raw| raw.id);
        raw_events
    }

    pub fn processing_issues(&self, raw_event_id: i64) -> Vec<ProcessingIssue> {
        self.inner()
            .processing_issues
            .iter()
            .filter(|(id, _)| *id == raw_event_id)
            .map(|(_, issue)| issue.clone())
            .collect()
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.inner().activities.clone()
    }

    pub fn event(&self, project_id: ProjectId, event_id: &str) -> Option<Payload> {
        self.inner()
            .events
            .get(&(project_id, event_id.to_owned()))
            .cloned()
    }

    pub fn event_count(&self) -> usize {
        self.inner().events.len()
    }

    pub fn attachments(&self) -> Vec<EventAttachment> {
        self.inner().attachments.clone()
    }

    pub fn file(&self, file_id: i64) -> Option<(NewFile, Vec<u8>)> {
        self.inner().files.get(&file_id).cloned()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn project(&self, project_id: ProjectId) -> Result<Option<Project>, StorageError> {
        Ok(self.inner().projects.get(&project_id).cloned())
    }

    async fn organization(&self, org_id: i64) -> Result<Option<Organization>, StorageError> {
        Ok(self.inner().organizations.get(&org_id).cloned())
    }

    async fn project_key(&self, key_id: i64) -> Result<Option<ProjectKey>, StorageError> {
        Ok(self.inner().project_keys.get(&key_id).cloned())
    }

    async fn project_option(
        &self,
        project_id: ProjectId,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        Ok(self.option(project_id, key))
    }

    async fn set_project_option(
        &self,
        project_id: ProjectId,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        self.set_option(project_id, key, value);
        Ok(())
    }

    async fn organization_option(
        &self,
        org_id: i64,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        Ok(self
            .inner()
            .organization_options
            .get(&(org_id, key.to_owned()))
            .cloned())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn delete_raw_event(
        &self,
        project_id: ProjectId,
        event_id: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner();
        if let Some(raw) = inner.raw_events.remove(&(project_id, event_id.to_owned())) {
            inner.processing_issues.retain(|(id, _)| *id != raw.id);
        }
        Ok(())
    }

    async fn delete_reprocessing_report(
        &self,
        project_id: ProjectId,
        event_id: &str,
    ) -> Result<bool, StorageError> {
        Ok(self
            .inner()
            .reprocessing_reports
            .remove(&(project_id, event_id.to_owned())))
    }

    async fn create_raw_event(
        &self,
        project_id: ProjectId,
        event_id: &str,
        datetime: DateTime<Utc>,
        data: &Payload,
    ) -> Result<RawEvent, StorageError> {
        let mut inner = self.inner();
        let raw = RawEvent {
            id: inner.next_id(),
            project_id,
            event_id: event_id.to_owned(),
            datetime,
            data: data.clone(),
        };
        inner
            .raw_events
            .insert((project_id, event_id.to_owned()), raw.clone());
        Ok(raw)
    }

    async fn record_processing_issue(
        &self,
        raw_event: &RawEvent,
        issue: &ProcessingIssue,
    ) -> Result<(), StorageError> {
        self.inner()
            .processing_issues
            .push((raw_event.id, issue.clone()));
        Ok(())
    }

    async fn create_activity(&self, activity: &Activity) -> Result<(), StorageError> {
        self.inner().activities.push(activity.clone());
        Ok(())
    }

    async fn create_file(&self, file: &NewFile) -> Result<i64, StorageError> {
        let mut inner = self.inner();
        let id = inner.next_id();
        inner.files.insert(id, (file.clone(), Vec::new()));
        Ok(id)
    }

    async fn put_file_contents(&self, file_id: i64, contents: &[u8]) -> Result<(), StorageError> {
        match self.inner().files.get_mut(&file_id) {
            Some((_, blob)) => {
                *blob = contents.to_vec();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                kind: "file",
                id: file_id,
            }),
        }
    }

    async fn create_event_attachment(
        &self,
        attachment: &EventAttachment,
    ) -> Result<(), StorageError> {
        self.inner().attachments.push(attachment.clone());
        Ok(())
    }
}

#[async_trait]
impl EventCommitter for MemoryStore {
    async fn commit(
        &self,
        project_id: ProjectId,
        payload: &Payload,
    ) -> Result<StoredEvent, CommitError> {
        let event_id = committed_event_id(payload);
        let mut inner = self.inner();
        let key = (project_id, event_id.clone());
        if inner.events.contains_key(&key) {
            return Err(CommitError::HashDiscarded);
        }
        inner.events.insert(key, payload.clone());

        Ok(StoredEvent {
            event_id,
            project_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Refund {
    pub project_id: ProjectId,
    pub key_id: Option<i64>,
    pub timestamp: Option<f64>,
}

#[derive(Default)]
pub struct MemoryQuota {
    refunds: Mutex<Vec<Refund>>,
}

impl MemoryQuota {
    pub fn refunds(&self) -> Vec<Refund> {
        self.refunds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Quota for MemoryQuota {
    async fn refund(
        &self,
        project: &Project,
        key: Option<&ProjectKey>,
        timestamp: Option<f64>,
    ) -> Result<(), StorageError> {
        self.refunds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Refund {
                project_id: project.id,
                key_id: key.map(|k| k.id),
                timestamp,
            });
        Ok(())
    }
}
