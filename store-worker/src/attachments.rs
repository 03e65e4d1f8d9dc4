use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use store_common::cache::{get_json, set_json, BlobCache, CacheError};
use tracing::{debug, warn};

use crate::app_context::AppContext;
use crate::commit::StoredEvent;
use crate::error::StoreError;
use crate::metric_consts::ATTACHMENTS_SKIPPED;
use crate::settings::{Project, STORE_CRASH_REPORTS};
use crate::storage::{EventAttachment, NewFile};

/// Attachment types that count as crash reports and are subject to the
/// `store_crash_reports` policy.
pub const CRASH_REPORT_TYPES: &[&str] = &["event.minidump"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAttachment {
    pub name: String,
    #[serde(rename = "type", default = "default_attachment_type")]
    pub attachment_type: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

fn default_attachment_type() -> String {
    "event.attachment".to_owned()
}

impl CachedAttachment {
    pub fn is_crash_report(&self) -> bool {
        CRASH_REPORT_TYPES.contains(&self.attachment_type.as_str())
    }
}

pub fn attachment_cache_key(cache_key: &str) -> String {
    format!("attachments:{cache_key}")
}

/// Attachments stored next to the payload under `cache_key`. A missing or
/// unreadable entry reads as no attachments.
pub async fn get_cached_attachments(cache: &dyn BlobCache, cache_key: &str) -> Vec<CachedAttachment> {
    let key = attachment_cache_key(cache_key);
    match get_json::<Vec<CachedAttachment>>(cache, &key).await {
        Ok(attachments) => attachments.unwrap_or_default(),
        Err(err) => {
            warn!(cache_key = %key, "failed to read cached attachments: {err}");
            Vec::new()
        }
    }
}

pub async fn set_cached_attachments(
    cache: &dyn BlobCache,
    cache_key: &str,
    attachments: &[CachedAttachment],
    ttl: std::time::Duration,
) -> Result<(), CacheError> {
    set_json(cache, &attachment_cache_key(cache_key), attachments, ttl).await
}

pub async fn delete_cached_attachments(cache: &dyn BlobCache, cache_key: &str) {
    let key = attachment_cache_key(cache_key);
    if let Err(err) = cache.delete(&key).await {
        warn!(cache_key = %key, "failed to delete cached attachments: {err}");
    }
}

/// Crash reports are stored when either the project or its organization
/// opted in.
async fn crash_reports_allowed(context: &AppContext, project: &Project) -> Result<bool, StoreError> {
    if context
        .settings
        .project_flag(project.id, STORE_CRASH_REPORTS)
        .await?
    {
        return Ok(true);
    }
    Ok(context
        .settings
        .organization_flag(project.organization_id, STORE_CRASH_REPORTS)
        .await?)
}

/// Persist one attachment of a stored event. Returns whether it was saved.
pub async fn save_attachment(
    context: &AppContext,
    event: &StoredEvent,
    project: &Project,
    attachment: &CachedAttachment,
) -> Result<bool, StoreError> {
    if attachment.is_crash_report() && !crash_reports_allowed(context, project).await? {
        debug!(
            project = project.id,
            event_id = %event.event_id,
            name = %attachment.name,
            "crash report storage disabled, skipping attachment"
        );
        metrics::counter!(ATTACHMENTS_SKIPPED).increment(1);
        return Ok(false);
    }

    let mut headers = BTreeMap::new();
    if let Some(content_type) = &attachment.content_type {
        headers.insert("Content-Type".to_owned(), content_type.clone());
    }
    let file = NewFile {
        name: attachment.name.clone(),
        file_type: attachment.attachment_type.clone(),
        headers,
    };

    let file_id = context.storage.create_file(&file).await?;
    context
        .storage
        .put_file_contents(file_id, &attachment.data)
        .await?;
    context
        .storage
        .create_event_attachment(&EventAttachment {
            event_id: event.event_id.clone(),
            project_id: event.project_id,
            name: attachment.name.clone(),
            file_id,
        })
        .await?;

    Ok(true)
}
