use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;

use crate::error::StorageError;
use crate::metric_consts::SETTINGS_CACHE;
use crate::payload::ProjectId;

pub const REPROCESSING_ACTIVE: &str = "reprocessing_active";
pub const SENT_FAILED_EVENT_HINT: &str = "sent_failed_event_hint";
pub const STORE_CRASH_REPORTS: &str = "store_crash_reports";
pub const PROCESSING_REVISION: &str = "processing_rev";

pub const EVENT_ATTACHMENTS_FEATURE: &str = "event-attachments";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: ProjectId,
    pub organization_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    pub id: i64,
    pub features: HashSet<String>,
}

impl Organization {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectKey {
    pub id: i64,
    pub project_id: ProjectId,
}

/// Source of truth for projects, organizations and their options.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn project(&self, project_id: ProjectId) -> Result<Option<Project>, StorageError>;

    async fn organization(&self, org_id: i64) -> Result<Option<Organization>, StorageError>;

    async fn project_key(&self, key_id: i64) -> Result<Option<ProjectKey>, StorageError>;

    async fn project_option(
        &self,
        project_id: ProjectId,
        key: &str,
    ) -> Result<Option<Value>, StorageError>;

    async fn set_project_option(
        &self,
        project_id: ProjectId,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError>;

    async fn organization_option(&self, org_id: i64, key: &str)
        -> Result<Option<Value>, StorageError>;
}

/// Cached access to a `SettingsStore`. Missing values are cached too.
pub struct Settings {
    store: Arc<dyn SettingsStore>,
    project_options: Cache<(ProjectId, String), Option<Value>>,
    organization_options: Cache<(i64, String), Option<Value>>,
    projects: Cache<ProjectId, Option<Project>>,
    organizations: Cache<i64, Option<Organization>>,
}

fn cache_hit(kind: &'static str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    metrics::counter!(SETTINGS_CACHE, "type" => kind, "outcome" => outcome).increment(1);
}

fn is_enabled(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(text)) => matches!(text.as_str(), "1" | "true"),
        _ => false,
    }
}

impl Settings {
    pub fn new(store: Arc<dyn SettingsStore>, max_entries: u64, ttl: Duration) -> Self {
        Self {
            store,
            project_options: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            organization_options: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            projects: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            organizations: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn project_option(
        &self,
        project_id: ProjectId,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        let cache_key = (project_id, key.to_owned());
        if let Some(value) = self.project_options.get(&cache_key).await {
            cache_hit("project_option", true);
            return Ok(value);
        }
        cache_hit("project_option", false);
        self.project_option_uncached(project_id, key).await
    }

    /// Read an option from the store, refreshing the cached copy.
    pub async fn project_option_uncached(
        &self,
        project_id: ProjectId,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        let value = self.store.project_option(project_id, key).await?;
        self.project_options
            .insert((project_id, key.to_owned()), value.clone())
            .await;
        Ok(value)
    }

    /// A boolean project option. Unset options read as false.
    pub async fn project_flag(&self, project_id: ProjectId, key: &str) -> Result<bool, StorageError> {
        let value = self.project_option(project_id, key).await?;
        Ok(is_enabled(value.as_ref()))
    }

    /// Write through to the store, so later reads in this process see the value.
    pub async fn set_project_option(
        &self,
        project_id: ProjectId,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        self.store
            .set_project_option(project_id, key, value.clone())
            .await?;
        self.project_options
            .insert((project_id, key.to_owned()), Some(value))
            .await;
        Ok(())
    }

    pub async fn organization_flag(&self, org_id: i64, key: &str) -> Result<bool, StorageError> {
        let cache_key = (org_id, key.to_owned());
        let value = match self.organization_options.get(&cache_key).await {
            Some(value) => {
                cache_hit("organization_option", true);
                value
            }
            None => {
                cache_hit("organization_option", false);
                let value = self.store.organization_option(org_id, key).await?;
                self.organization_options
                    .insert(cache_key, value.clone())
                    .await;
                value
            }
        };
        Ok(is_enabled(value.as_ref()))
    }

    pub async fn project(&self, project_id: ProjectId) -> Result<Project, StorageError> {
        let project = match self.projects.get(&project_id).await {
            Some(project) => {
                cache_hit("project", true);
                project
            }
            None => {
                cache_hit("project", false);
                let project = self.store.project(project_id).await?;
                self.projects.insert(project_id, project.clone()).await;
                project
            }
        };
        project.ok_or(StorageError::NotFound {
            kind: "project",
            id: project_id,
        })
    }

    pub async fn organization(&self, org_id: i64) -> Result<Organization, StorageError> {
        let organization = match self.organizations.get(&org_id).await {
            Some(organization) => {
                cache_hit("organization", true);
                organization
            }
            None => {
                cache_hit("organization", false);
                let organization = self.store.organization(org_id).await?;
                self.organizations
                    .insert(org_id, organization.clone())
                    .await;
                organization
            }
        };
        organization.ok_or(StorageError::NotFound {
            kind: "organization",
            id: org_id,
        })
    }

    /// Project keys are looked up rarely, only for quota refunds.
    pub async fn project_key(&self, key_id: i64) -> Result<Option<ProjectKey>, StorageError> {
        self.store.project_key(key_id).await
    }

    /// The project's current reprocessing revision. The pipeline records a
    /// cached read when it starts, and compares it against an uncached read
    /// before diverting an event.
    pub async fn reprocessing_revision(
        &self,
        project_id: ProjectId,
        cached: bool,
    ) -> Result<Option<String>, StorageError> {
        let value = if cached {
            self.project_option(project_id, PROCESSING_REVISION).await?
        } else {
            self.project_option_uncached(project_id, PROCESSING_REVISION)
                .await?
        };

        Ok(match value {
            None | Some(Value::Null) => None,
            Some(Value::String(revision)) => Some(revision),
            Some(other) => Some(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryStore;

    fn settings(store: Arc<MemoryStore>) -> Settings {
        Settings::new(store, 100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn flags_default_to_false() {
        let store = Arc::new(MemoryStore::default());
        let settings = settings(store);

        assert!(!settings.project_flag(1, REPROCESSING_ACTIVE).await.unwrap());
        assert!(!settings.organization_flag(1, STORE_CRASH_REPORTS).await.unwrap());
    }

    #[tokio::test]
    async fn cached_reads_hide_concurrent_changes() {
        let store = Arc::new(MemoryStore::default());
        store.set_option(1, PROCESSING_REVISION, json!("r1"));
        let settings = settings(store.clone());

        assert_eq!(
            settings.reprocessing_revision(1, true).await.unwrap(),
            Some("r1".to_owned())
        );

        store.set_option(1, PROCESSING_REVISION, json!("r2"));
        assert_eq!(
            settings.reprocessing_revision(1, true).await.unwrap(),
            Some("r1".to_owned())
        );
        assert_eq!(
            settings.reprocessing_revision(1, false).await.unwrap(),
            Some("r2".to_owned())
        );
        // The uncached read refreshed the cache.
        assert_eq!(
            settings.reprocessing_revision(1, true).await.unwrap(),
            Some("r2".to_owned())
        );
    }

    #[tokio::test]
    async fn writes_go_through() {
        let store = Arc::new(MemoryStore::default());
        let settings = settings(store.clone());

        assert!(!settings.project_flag(3, SENT_FAILED_EVENT_HINT).await.unwrap());
        settings
            .set_project_option(3, SENT_FAILED_EVENT_HINT, json!(true))
            .await
            .unwrap();

        assert!(settings.project_flag(3, SENT_FAILED_EVENT_HINT).await.unwrap());
        assert_eq!(store.option(3, SENT_FAILED_EVENT_HINT), Some(json!(true)));
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let store = Arc::new(MemoryStore::default());
        let settings = settings(store.clone());

        assert!(matches!(
            settings.project(9).await,
            Err(StorageError::NotFound { kind: "project", id: 9 })
        ));

        store.add_project(10, 20);
        assert_eq!(
            settings.project(10).await.unwrap(),
            Project {
                id: 10,
                organization_id: 20
            }
        );
    }
}
