use store_common::cache::set_json;
use store_common::metrics::timing_guard;
use tracing::{debug, error, Instrument};

use crate::app_context::AppContext;
use crate::commit::committed_event_id;
use crate::context::EventContext;
use crate::error::StoreError;
use crate::metric_consts::STAGE_DURATION;
use crate::payload::Payload;
use crate::stages::{event_failed, load_payload};
use crate::tasks::{cache_key_for_event, PreprocessArgs, ProcessArgs, SaveArgs};

/// Decide whether an event needs enrichment. Events no plugin and no stack
/// trace step cares about go straight to the save stage.
pub async fn preprocess_event(
    context: &AppContext,
    args: PreprocessArgs,
    from_reprocessing: bool,
) -> Result<(), StoreError> {
    let PreprocessArgs {
        cache_key,
        data,
        start_time,
        event_id,
    } = args;

    let Some(payload) = load_payload(context, cache_key.as_deref(), data).await? else {
        error!(cache_key = cache_key.as_deref(), "preprocess.failed.empty");
        event_failed("cache", "pre");
        return Ok(());
    };
    let project_id = payload.project_id().ok_or(StoreError::MissingProject)?;
    let event_id = event_id.or_else(|| payload.event_id().map(str::to_owned));
    let event = EventContext::new(project_id, event_id.as_deref());

    let _timer = timing_guard(STAGE_DURATION, &[("stage", "preprocess")]);
    dispatch(
        context,
        &event,
        payload,
        cache_key,
        start_time,
        from_reprocessing,
    )
    .instrument(event.span("preprocess"))
    .await
}

async fn dispatch(
    context: &AppContext,
    event: &EventContext,
    payload: Payload,
    cache_key: Option<String>,
    start_time: Option<f64>,
    from_reprocessing: bool,
) -> Result<(), StoreError> {
    let needs_processing =
        context.plugins.wants(&payload) || context.stacktraces.has_stacktraces(&payload);

    if !needs_processing {
        debug!("no enrichment needed, saving directly");
        context
            .scheduler
            .submit_save(SaveArgs {
                cache_key,
                data: Some(payload),
                start_time,
                event_id: event.event_id.clone(),
                project_id: Some(event.project_id),
            })
            .await?;
        return Ok(());
    }

    // The process stage works on cached payloads only.
    let cache_key = match cache_key {
        Some(cache_key) => cache_key,
        None => {
            let event_id = match &event.event_id {
                Some(event_id) => event_id.clone(),
                None => committed_event_id(&payload),
            };
            let cache_key = cache_key_for_event(event.project_id, &event_id);
            set_json(
                context.cache.as_ref(),
                &cache_key,
                &payload,
                context.cache_ttl(),
            )
            .await?;
            cache_key
        }
    };

    context
        .scheduler
        .submit_process(
            from_reprocessing,
            ProcessArgs {
                cache_key,
                start_time,
                event_id: event.event_id.clone(),
                data: None,
            },
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_utils::TestHarness;

    #[tokio::test]
    async fn plain_events_skip_processing() {
        let harness = TestHarness::new();
        let raw = json!({"event_id": "e1", "project": 1, "platform": "python"});
        harness.cache_payload("e:e1:1", raw.clone()).await;

        preprocess_event(
            &harness.context,
            PreprocessArgs {
                cache_key: Some("e:e1:1".to_owned()),
                start_time: Some(1.0),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();

        assert!(harness.queue.pending("events.process_event").is_empty());
        let saves = harness.queue.pending("events.save_event");
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].args["data"], raw);
        assert_eq!(saves[0].args["cache_key"], json!("e:e1:1"));
        assert_eq!(saves[0].args["event_id"], json!("e1"));
        assert_eq!(saves[0].args["project_id"], json!(1));
    }

    #[tokio::test]
    async fn inline_events_are_cached_for_processing() {
        let harness = TestHarness::with_stacktraces();
        let payload = Payload::from_value(json!({
            "event_id": "e2",
            "project": 4,
            "stacktrace": {"frames": [{"function": "main"}]},
        }))
        .unwrap();

        preprocess_event(
            &harness.context,
            PreprocessArgs {
                data: Some(payload.clone()),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();

        let process = harness.queue.pending("events.reprocessing.process_event");
        assert_eq!(process.len(), 1);
        assert_eq!(process[0].args["cache_key"], json!("e:e2:4"));
        assert_eq!(harness.cached_payload("e:e2:4").await, Some(payload));
    }

    #[tokio::test]
    async fn cache_miss_ends_the_event() {
        let harness = TestHarness::new();

        preprocess_event(
            &harness.context,
            PreprocessArgs {
                cache_key: Some("e:gone:1".to_owned()),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();

        assert!(harness.queue.is_empty());
    }
}
