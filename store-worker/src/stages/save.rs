use chrono::Utc;
use store_common::metrics::timing_guard;
use store_common::outcomes::{track_outcome, Outcome, OutcomeRecord};
use tracing::{debug, error, info, warn, Instrument};

use crate::app_context::AppContext;
use crate::attachments::{delete_cached_attachments, get_cached_attachments, save_attachment};
use crate::commit::StoredEvent;
use crate::context::EventContext;
use crate::error::{CommitError, StoreError};
use crate::metric_consts::{STAGE_DURATION, TIME_TO_PROCESS};
use crate::payload::{Payload, ProjectId};
use crate::reprocessing::delete_raw_event;
use crate::settings::{Project, ProjectKey, EVENT_ATTACHMENTS_FEATURE};
use crate::stages::{event_failed, load_payload};
use crate::tasks::SaveArgs;
use crate::{epoch_seconds, to_datetime};

/// Reason recorded on the outcome of an event the commit layer discarded.
pub const DISCARDED_HASH: &str = "discarded-hash";

enum Saved {
    Stored { attachments_enabled: bool },
    Discarded,
}

/// The persistence stage: commit the event, save its attachments, account for
/// the outcome and clean up the cache.
pub async fn save_event(context: &AppContext, args: SaveArgs) -> Result<(), StoreError> {
    let SaveArgs {
        cache_key,
        data,
        start_time,
        event_id,
        project_id,
    } = args;

    let mut payload = load_payload(context, cache_key.as_deref(), data).await?;
    let event_id = event_id.or_else(|| {
        payload
            .as_ref()
            .and_then(|payload| payload.event_id().map(str::to_owned))
    });
    let project_id = match project_id {
        Some(project_id) => Some(project_id),
        None => payload.as_mut().and_then(Payload::take_project_id),
    };
    let Some(project_id) = project_id else {
        error!(cache_key = cache_key.as_deref(), "save.failed.project");
        event_failed("project", "post");
        return Ok(());
    };

    let event = EventContext::new(project_id, event_id.as_deref());
    let _timer = timing_guard(STAGE_DURATION, &[("stage", "save")]);
    save(context, &event, payload, cache_key, start_time)
        .instrument(event.span("save"))
        .await
}

async fn save(
    context: &AppContext,
    event: &EventContext,
    payload: Option<Payload>,
    cache_key: Option<String>,
    start_time: Option<f64>,
) -> Result<(), StoreError> {
    delete_raw_event(context, event.project_id, event.event_id.as_deref(), true).await?;

    let Some(payload) = payload.filter(|payload| !payload.is_empty()) else {
        error!(cache_key = cache_key.as_deref(), "save.failed.empty");
        event_failed("cache", "post");
        return Ok(());
    };
    let platform = payload.platform().to_owned();

    let result = commit(context, event, &payload, cache_key.as_deref(), start_time).await;

    if let Some(cache_key) = &cache_key {
        if let Err(err) = context.cache.delete(cache_key).await {
            warn!(cache_key = %cache_key, "failed to delete cached payload: {err}");
        }
        // Without the feature the attachments are left for their own expiry.
        let keep_attachments = matches!(
            result,
            Ok(Saved::Stored {
                attachments_enabled: false
            })
        );
        if !keep_attachments {
            delete_cached_attachments(context.cache.as_ref(), cache_key).await;
        }
    }

    if let Some(start_time) = start_time {
        let elapsed = (epoch_seconds() - start_time).max(0.0);
        metrics::histogram!(TIME_TO_PROCESS, "platform" => platform).record(elapsed);
    }

    result.map(|_| ())
}

async fn commit(
    context: &AppContext,
    event: &EventContext,
    payload: &Payload,
    cache_key: Option<&str>,
    start_time: Option<f64>,
) -> Result<Saved, StoreError> {
    let project = context.settings.project(event.project_id).await?;
    let key_id = payload.key_id();
    let outcome = |outcome: Outcome, reason: Option<&str>| OutcomeRecord {
        org_id: project.organization_id,
        project_id: project.id,
        key_id,
        outcome,
        reason: reason.map(str::to_owned),
        timestamp: start_time.and_then(to_datetime).unwrap_or_else(Utc::now),
        event_id: event.event_id.clone(),
    };

    match context.committer.commit(event.project_id, payload).await {
        Ok(stored) => accept(
            context,
            &project,
            &stored,
            cache_key,
            outcome(Outcome::Accepted, None),
        )
        .await
        .map_err(|err| after_commit(event, err)),
        Err(CommitError::HashDiscarded) => {
            info!("event hash discarded");
            discard(
                context,
                &project,
                key_id,
                start_time,
                outcome(Outcome::Filtered, Some(DISCARDED_HASH)),
            )
            .await
            .map_err(|err| after_commit(event, err))
        }
        Err(CommitError::Storage(err)) => Err(err.into()),
    }
}

/// Past a commit, running the task again would commit or refund twice.
fn after_commit(event: &EventContext, source: StoreError) -> StoreError {
    StoreError::AfterCommit {
        event_id: event.event_id.clone(),
        source: Box::new(source),
    }
}

async fn accept(
    context: &AppContext,
    project: &Project,
    stored: &StoredEvent,
    cache_key: Option<&str>,
    accepted: OutcomeRecord,
) -> Result<Saved, StoreError> {
    let organization = context.settings.organization(project.organization_id).await?;
    let attachments_enabled = organization.has_feature(EVENT_ATTACHMENTS_FEATURE);

    if attachments_enabled {
        if let Some(cache_key) = cache_key {
            for attachment in get_cached_attachments(context.cache.as_ref(), cache_key).await {
                save_attachment(context, stored, project, &attachment).await?;
            }
        }
    }

    track_outcome(context.outcomes.as_ref(), accepted).await?;
    debug!(event_id = %stored.event_id, "event saved");
    Ok(Saved::Stored {
        attachments_enabled,
    })
}

async fn discard(
    context: &AppContext,
    project: &Project,
    key_id: Option<i64>,
    start_time: Option<f64>,
    filtered: OutcomeRecord,
) -> Result<Saved, StoreError> {
    let key = match key_id {
        Some(key_id) => refund_key(context, project.id, key_id).await?,
        None => None,
    };
    context
        .quotas
        .refund(project, key.as_ref(), start_time)
        .await?;
    track_outcome(context.outcomes.as_ref(), filtered).await?;
    Ok(Saved::Discarded)
}

/// The project key to refund, if it exists and belongs to the project.
async fn refund_key(
    context: &AppContext,
    project_id: ProjectId,
    key_id: i64,
) -> Result<Option<ProjectKey>, StoreError> {
    let key = context.settings.project_key(key_id).await?;
    Ok(key.filter(|key| key.project_id == project_id))
}
