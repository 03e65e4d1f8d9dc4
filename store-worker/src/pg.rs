//! PostgreSQL implementations of the storage collaborators, against the
//! tables created by the migrations in `migrations/`.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::commit::{committed_event_id, EventCommitter, StoredEvent};
use crate::error::{CommitError, StorageError};
use crate::payload::{Payload, ProjectId};
use crate::settings::{Organization, Project, ProjectKey, SettingsStore};
use crate::storage::{Activity, EventAttachment, NewFile, ProcessingIssue, RawEvent, Storage};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    organization_id: i64,
}

#[derive(sqlx::FromRow)]
struct OrganizationRow {
    id: i64,
    features: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct ProjectKeyRow {
    id: i64,
    project_id: i64,
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn project(&self, project_id: ProjectId) -> Result<Option<Project>, StorageError> {
        let row: Option<ProjectRow> =
            sqlx::query_as("SELECT id, organization_id FROM store_projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|row| Project {
            id: row.id,
            organization_id: row.organization_id,
        }))
    }

    async fn organization(&self, org_id: i64) -> Result<Option<Organization>, StorageError> {
        let row: Option<OrganizationRow> =
            sqlx::query_as("SELECT id, features FROM store_organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|row| Organization {
            id: row.id,
            features: row.features.into_iter().collect(),
        }))
    }

    async fn project_key(&self, key_id: i64) -> Result<Option<ProjectKey>, StorageError> {
        let row: Option<ProjectKeyRow> =
            sqlx::query_as("SELECT id, project_id FROM store_project_keys WHERE id = $1")
                .bind(key_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|row| ProjectKey {
            id: row.id,
            project_id: row.project_id,
        }))
    }

    async fn project_option(
        &self,
        project_id: ProjectId,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        let value: Option<Json<Value>> = sqlx::query_scalar(
            "SELECT value FROM store_project_options WHERE project_id = $1 AND key = $2",
        )
        .bind(project_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.map(|value| value.0))
    }

    async fn set_project_option(
        &self,
        project_id: ProjectId,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
INSERT INTO store_project_options
    (project_id, key, value)
VALUES
    ($1, $2, $3)
ON CONFLICT (project_id, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(project_id)
        .bind(key)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn organization_option(
        &self,
        org_id: i64,
        key: &str,
    ) -> Result<Option<Value>, StorageError> {
        let value: Option<Json<Value>> = sqlx::query_scalar(
            "SELECT value FROM store_organization_options WHERE organization_id = $1 AND key = $2",
        )
        .bind(org_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.map(|value| value.0))
    }
}

#[async_trait]
impl Storage for PgStore {
    async fn delete_raw_event(
        &self,
        project_id: ProjectId,
        event_id: &str,
    ) -> Result<(), StorageError> {
        // Processing issues go with it, through ON DELETE CASCADE.
        sqlx::query("DELETE FROM store_raw_events WHERE project_id = $1 AND event_id = $2")
            .bind(project_id)
            .bind(event_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_reprocessing_report(
        &self,
        project_id: ProjectId,
        event_id: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "DELETE FROM store_reprocessing_reports WHERE project_id = $1 AND event_id = $2",
        )
        .bind(project_id)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_raw_event(
        &self,
        project_id: ProjectId,
        event_id: &str,
        datetime: DateTime<Utc>,
        data: &Payload,
    ) -> Result<RawEvent, StorageError> {
        let id: i64 = sqlx::query_scalar(
            r#"
INSERT INTO store_raw_events
    (project_id, event_id, datetime, data)
VALUES
    ($1, $2, $3, $4)
ON CONFLICT (project_id, event_id) DO UPDATE
    SET datetime = EXCLUDED.datetime, data = EXCLUDED.data
RETURNING id
            "#,
        )
        .bind(project_id)
        .bind(event_id)
        .bind(datetime)
        .bind(Json(data))
        .fetch_one(&self.pool)
        .await?;

        Ok(RawEvent {
            id,
            project_id,
            event_id: event_id.to_owned(),
            datetime,
            data: data.clone(),
        })
    }

    async fn record_processing_issue(
        &self,
        raw_event: &RawEvent,
        issue: &ProcessingIssue,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
INSERT INTO store_processing_issues
    (raw_event_id, project_id, scope, object, type, data, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(raw_event.id)
        .bind(raw_event.project_id)
        .bind(&issue.scope)
        .bind(&issue.object)
        .bind(&issue.issue_type)
        .bind(Json(&issue.data))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_activity(&self, activity: &Activity) -> Result<(), StorageError> {
        sqlx::query(
            r#"
INSERT INTO store_activities
    (project_id, type, datetime, data)
VALUES
    ($1, $2, $3, $4)
            "#,
        )
        .bind(activity.project_id)
        .bind(activity.kind.as_str())
        .bind(activity.datetime)
        .bind(Json(&activity.data))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_file(&self, file: &NewFile) -> Result<i64, StorageError> {
        let id: i64 = sqlx::query_scalar(
            r#"
INSERT INTO store_files
    (name, type, headers, created_at)
VALUES
    ($1, $2, $3, NOW())
RETURNING id
            "#,
        )
        .bind(&file.name)
        .bind(&file.file_type)
        .bind(Json(&file.headers))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn put_file_contents(&self, file_id: i64, contents: &[u8]) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE store_files SET contents = $2, size = $3 WHERE id = $1")
            .bind(file_id)
            .bind(contents)
            .bind(i64::try_from(contents.len()).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                kind: "file",
                id: file_id,
            });
        }
        Ok(())
    }

    async fn create_event_attachment(
        &self,
        attachment: &EventAttachment,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
INSERT INTO store_event_attachments
    (event_id, project_id, name, file_id, created_at)
VALUES
    ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(&attachment.event_id)
        .bind(attachment.project_id)
        .bind(&attachment.name)
        .bind(attachment.file_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EventCommitter for PgStore {
    async fn commit(
        &self,
        project_id: ProjectId,
        payload: &Payload,
    ) -> Result<StoredEvent, CommitError> {
        let event_id = committed_event_id(payload);
        let datetime = payload
            .timestamp()
            .and_then(crate::to_datetime)
            .unwrap_or_else(Utc::now);

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
INSERT INTO store_events
    (project_id, event_id, datetime, data)
VALUES
    ($1, $2, $3, $4)
ON CONFLICT (project_id, event_id) DO NOTHING
RETURNING id
            "#,
        )
        .bind(project_id)
        .bind(&event_id)
        .bind(datetime)
        .bind(Json(payload))
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;

        match inserted {
            Some(_) => Ok(StoredEvent {
                event_id,
                project_id,
            }),
            None => Err(CommitError::HashDiscarded),
        }
    }
}
