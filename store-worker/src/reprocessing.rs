//! Diversion of events that could not be processed into durable raw events,
//! gated on the project's reprocessing settings.
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app_context::AppContext;
use crate::context::EventContext;
use crate::error::StoreError;
use crate::metric_consts::{EVENTS_DIVERTED, PIPELINE_RESTARTS};
use crate::payload::{Payload, ProjectId};
use crate::settings::{REPROCESSING_ACTIVE, SENT_FAILED_EVENT_HINT};
use crate::stages::{event_failed, load_payload};
use crate::storage::{Activity, ActivityKind, ProcessingIssue};

/// What happened to an event handed to `divert_failed_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diversion {
    /// The project's revision moved on while the event was in flight; the
    /// whole pipeline should run again.
    RetryFromScratch,
    /// Reprocessing is off, the event continues to be saved with its issues.
    NotStored,
    /// The event was archived as a raw event.
    Stored,
    /// The original payload vanished from the cache before it could be archived.
    Dropped,
}

impl Diversion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Diversion::RetryFromScratch => "retry_from_scratch",
            Diversion::NotStored => "not_stored",
            Diversion::Stored => "stored",
            Diversion::Dropped => "dropped",
        }
    }
}

pub async fn divert_failed_event(
    context: &AppContext,
    event: &EventContext,
    cache_key: &str,
    issues: &[ProcessingIssue],
    start_revision: Option<&str>,
    start_time: Option<f64>,
) -> Result<Diversion, StoreError> {
    let project_id = event.project_id;
    let reprocessing_active = context
        .settings
        .project_flag(project_id, REPROCESSING_ACTIVE)
        .await?;

    if reprocessing_active {
        let current = context
            .settings
            .reprocessing_revision(project_id, false)
            .await?;
        if current.as_deref() != start_revision {
            info!(
                project = project_id,
                start_revision, current_revision = current.as_deref(),
                "reprocessing revision changed, restarting pipeline"
            );
            metrics::counter!(PIPELINE_RESTARTS).increment(1);
            return Ok(Diversion::RetryFromScratch);
        }
    }

    if !context
        .settings
        .project_flag(project_id, SENT_FAILED_EVENT_HINT)
        .await?
    {
        let activity = Activity {
            project_id,
            kind: ActivityKind::NewProcessingIssues,
            datetime: start_time
                .and_then(crate::to_datetime)
                .unwrap_or_else(Utc::now),
            data: json!({
                "reprocessing_active": reprocessing_active,
                "issues": issues,
            }),
        };
        context.storage.create_activity(&activity).await?;
        context
            .settings
            .set_project_option(project_id, SENT_FAILED_EVENT_HINT, json!(true))
            .await?;
    }

    let diversion = if reprocessing_active {
        store_raw_event(context, event, cache_key, issues).await?
    } else {
        Diversion::NotStored
    };

    metrics::counter!(EVENTS_DIVERTED, "result" => diversion.as_str()).increment(1);
    Ok(diversion)
}

async fn store_raw_event(
    context: &AppContext,
    event: &EventContext,
    cache_key: &str,
    issues: &[ProcessingIssue],
) -> Result<Diversion, StoreError> {
    let project_id = event.project_id;
    let event_id = event.event_id.as_deref();
    delete_raw_event(context, project_id, event_id, false).await?;

    // The original payload, not the partially enriched one.
    let Some(payload) = load_payload(context, Some(cache_key), None).await? else {
        event_failed("cache", "raw");
        warn!(cache_key, "original payload gone, dropping failed event");
        return Ok(Diversion::Dropped);
    };

    let event_id = match event_id.or(payload.event_id()) {
        Some(event_id) => event_id.to_owned(),
        None => crate::commit::committed_event_id(&payload),
    };
    let datetime = raw_event_datetime(&payload);

    let raw_event = context
        .storage
        .create_raw_event(project_id, &event_id, datetime, &payload)
        .await?;
    for issue in issues {
        context
            .storage
            .record_processing_issue(&raw_event, issue)
            .await?;
    }

    if let Err(err) = context.cache.delete(cache_key).await {
        warn!(cache_key, "failed to delete cached payload of raw event: {err}");
    }

    debug!(
        project = project_id,
        event_id = %event_id,
        issues = issues.len(),
        "stored raw event"
    );
    Ok(Diversion::Stored)
}

fn raw_event_datetime(payload: &Payload) -> chrono::DateTime<Utc> {
    payload
        .timestamp()
        .and_then(crate::to_datetime)
        .unwrap_or_else(Utc::now)
}

/// Delete any raw event and reprocessing report for (project, event_id).
/// When `allow_hint_clear` is set and a report existed while reprocessing is
/// active, the failed event hint is reset so the next failure notifies again.
pub async fn delete_raw_event(
    context: &AppContext,
    project_id: ProjectId,
    event_id: Option<&str>,
    allow_hint_clear: bool,
) -> Result<(), StoreError> {
    let Some(event_id) = event_id else {
        return Ok(());
    };

    context
        .storage
        .delete_raw_event(project_id, event_id)
        .await?;
    let had_report = context
        .storage
        .delete_reprocessing_report(project_id, event_id)
        .await?;

    if allow_hint_clear
        && had_report
        && context
            .settings
            .project_flag(project_id, REPROCESSING_ACTIVE)
            .await?
    {
        context
            .settings
            .set_project_option(project_id, SENT_FAILED_EVENT_HINT, json!(false))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::settings::PROCESSING_REVISION;
    use crate::test_utils::TestHarness;

    fn issue(object: &str) -> ProcessingIssue {
        ProcessingIssue {
            scope: "native".to_owned(),
            object: object.to_owned(),
            issue_type: "native_missing_dsym".to_owned(),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn inactive_reprocessing_stores_nothing() {
        let harness = TestHarness::new();
        harness.store.add_project(1, 10);
        harness
            .cache_payload("e:e1:1", json!({"event_id": "e1", "project": 1}))
            .await;

        let event = EventContext::new(1, Some("e1"));
        let diversion =
            divert_failed_event(&harness.context, &event, "e:e1:1", &[issue("a")], None, None)
                .await
                .unwrap();

        assert_eq!(diversion, Diversion::NotStored);
        assert!(harness.store.raw_events().is_empty());
        assert_eq!(harness.store.activities().len(), 1);
        assert_eq!(
            harness.store.option(1, SENT_FAILED_EVENT_HINT),
            Some(json!(true))
        );
    }

    #[tokio::test]
    async fn hint_activity_is_sent_once() {
        let harness = TestHarness::new();
        harness.store.add_project(1, 10);
        let event = EventContext::new(1, Some("e1"));

        for _ in 0..3 {
            divert_failed_event(&harness.context, &event, "e:e1:1", &[issue("a")], None, None)
                .await
                .unwrap();
        }
        assert_eq!(harness.store.activities().len(), 1);
        assert_eq!(
            harness.store.activities()[0].data["reprocessing_active"],
            json!(false)
        );
    }

    #[tokio::test]
    async fn active_reprocessing_replaces_raw_event() {
        let harness = TestHarness::new();
        harness.store.add_project(1, 10);
        harness.store.set_option(1, REPROCESSING_ACTIVE, json!(true));
        harness
            .cache_payload(
                "e:e1:1",
                json!({"event_id": "e1", "project": 1, "timestamp": 1_700_000_000.0}),
            )
            .await;
        let event = EventContext::new(1, Some("e1"));

        let diversion =
            divert_failed_event(&harness.context, &event, "e:e1:1", &[issue("a")], None, None)
                .await
                .unwrap();
        assert_eq!(diversion, Diversion::Stored);
        assert!(harness.cached_payload("e:e1:1").await.is_none());

        harness
            .cache_payload("e:e1:1", json!({"event_id": "e1", "project": 1}))
            .await;
        let diversion = divert_failed_event(
            &harness.context,
            &event,
            "e:e1:1",
            &[issue("b"), issue("c")],
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(diversion, Diversion::Stored);

        let raw_events = harness.store.raw_events();
        assert_eq!(raw_events.len(), 1);
        assert_eq!(harness.store.processing_issues(raw_events[0].id).len(), 2);
    }

    #[tokio::test]
    async fn raw_event_takes_the_payload_timestamp() {
        let harness = TestHarness::new();
        harness.store.add_project(1, 10);
        harness.store.set_option(1, REPROCESSING_ACTIVE, json!(true));
        harness
            .cache_payload(
                "e:e1:1",
                json!({"event_id": "e1", "project": 1, "timestamp": 1_700_000_000.0}),
            )
            .await;

        divert_failed_event(
            &harness.context,
            &EventContext::new(1, Some("e1")),
            "e:e1:1",
            &[issue("a")],
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            harness.store.raw_events()[0].datetime.timestamp(),
            1_700_000_000
        );
    }

    #[tokio::test]
    async fn hint_activity_is_dated_at_the_event_start() {
        let harness = TestHarness::new();
        harness.store.add_project(1, 10);

        divert_failed_event(
            &harness.context,
            &EventContext::new(1, Some("e1")),
            "e:e1:1",
            &[issue("a")],
            None,
            Some(1_700_000_123.0),
        )
        .await
        .unwrap();

        let activities = harness.store.activities();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].datetime.timestamp(), 1_700_000_123);
    }

    #[tokio::test]
    async fn stale_revision_restarts_without_records() {
        let harness = TestHarness::new();
        harness.store.add_project(1, 10);
        harness.store.set_option(1, REPROCESSING_ACTIVE, json!(true));
        harness.store.set_option(1, PROCESSING_REVISION, json!("r2"));
        let event = EventContext::new(1, Some("e1"));

        let diversion = divert_failed_event(
            &harness.context,
            &event,
            "e:e1:1",
            &[issue("a")],
            Some("r1"),
            None,
        )
        .await
        .unwrap();

        assert_eq!(diversion, Diversion::RetryFromScratch);
        assert!(harness.store.raw_events().is_empty());
        assert!(harness.store.activities().is_empty());
    }

    #[tokio::test]
    async fn missing_original_payload_is_dropped() {
        let harness = TestHarness::new();
        harness.store.add_project(1, 10);
        harness.store.set_option(1, REPROCESSING_ACTIVE, json!(true));

        let diversion = divert_failed_event(
            &harness.context,
            &EventContext::new(1, Some("e1")),
            "e:e1:1",
            &[issue("a")],
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(diversion, Diversion::Dropped);
        assert!(harness.store.raw_events().is_empty());
    }

    #[tokio::test]
    async fn clearing_a_report_resets_the_hint() {
        let harness = TestHarness::new();
        harness.store.add_project(1, 10);
        harness.store.set_option(1, REPROCESSING_ACTIVE, json!(true));
        harness.store.set_option(1, SENT_FAILED_EVENT_HINT, json!(true));
        harness.store.add_reprocessing_report(1, "e1");

        delete_raw_event(&harness.context, 1, Some("e1"), false)
            .await
            .unwrap();
        assert_eq!(
            harness.store.option(1, SENT_FAILED_EVENT_HINT),
            Some(json!(true))
        );

        harness.store.add_reprocessing_report(1, "e1");
        delete_raw_event(&harness.context, 1, Some("e1"), true)
            .await
            .unwrap();
        assert!(!harness.store.has_reprocessing_report(1, "e1"));
        assert_eq!(
            harness.store.option(1, SENT_FAILED_EVENT_HINT),
            Some(json!(false))
        );
    }
}
