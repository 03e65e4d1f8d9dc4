use std::time::Duration;

use store_common::cache::set_json;
use store_common::metrics::timing_guard;
use tracing::{debug, error, info, warn, Instrument};

use crate::app_context::AppContext;
use crate::context::EventContext;
use crate::epoch_seconds;
use crate::error::StoreError;
use crate::metric_consts::{PLUGIN_ERRORS, STAGE_DURATION};
use crate::payload::Payload;
use crate::plugins::{PluginResult, Step};
use crate::reprocessing::{divert_failed_event, Diversion};
use crate::stages::{event_failed, load_payload};
use crate::tasks::{PreprocessArgs, ProcessArgs, SaveArgs, TaskKind};

/// The enrichment stage: run enhancers, stack trace processing and
/// preprocessors over a cached payload, renormalize it if anything changed,
/// divert it if enrichment reported processing issues, and hand it to the
/// save stage.
pub async fn process_event(
    context: &AppContext,
    args: ProcessArgs,
    from_reprocessing: bool,
) -> Result<(), StoreError> {
    let ProcessArgs {
        cache_key,
        start_time,
        event_id,
        data,
    } = args;

    let Some(payload) = load_payload(context, Some(&cache_key), data).await? else {
        error!(cache_key = %cache_key, "process.failed.empty");
        event_failed("cache", "process");
        return Ok(());
    };
    let project_id = payload.project_id().ok_or(StoreError::MissingProject)?;
    let event_id = event_id.or_else(|| payload.event_id().map(str::to_owned));
    let event = EventContext::new(project_id, event_id.as_deref());

    let stage = ProcessStage {
        context,
        event: &event,
        cache_key,
        start_time,
        task: TaskKind::process(from_reprocessing),
    };

    let _timer = timing_guard(STAGE_DURATION, &[("stage", "process")]);
    stage
        .run(payload)
        .instrument(event.span("process"))
        .await
}

/// What running the enrichment steps left us with.
enum Enriched {
    Done { payload: Payload, has_changed: bool },
    Retrying,
}

struct ProcessStage<'a> {
    context: &'a AppContext,
    event: &'a EventContext,
    cache_key: String,
    start_time: Option<f64>,
    task: TaskKind,
}

impl ProcessStage<'_> {
    fn args(&self) -> ProcessArgs {
        ProcessArgs {
            cache_key: self.cache_key.clone(),
            start_time: self.start_time,
            event_id: self.event.event_id.clone(),
            data: None,
        }
    }

    async fn run(&self, payload: Payload) -> Result<(), StoreError> {
        let project_id = self.event.project_id;
        let start_revision = self
            .context
            .settings
            .reprocessing_revision(project_id, true)
            .await?;

        let (mut payload, has_changed) = match self.enrich(payload).await? {
            Enriched::Done {
                payload,
                has_changed,
            } => (payload, has_changed),
            Enriched::Retrying => return Ok(()),
        };

        let found = payload.project_id();
        if found != Some(project_id) {
            return Err(StoreError::ProjectMutated {
                event_id: self.event.event_id.clone(),
                expected: project_id,
                found,
            });
        }

        if has_changed {
            let normalized = self.context.normalizer().normalize(payload);
            payload = normalized.payload;

            if !normalized.issues.is_empty() {
                let diversion = divert_failed_event(
                    self.context,
                    self.event,
                    &self.cache_key,
                    &normalized.issues,
                    start_revision.as_deref(),
                    self.start_time,
                )
                .await?;

                match diversion {
                    Diversion::RetryFromScratch => return self.restart().await,
                    Diversion::Stored | Diversion::Dropped => return Ok(()),
                    Diversion::NotStored => {}
                }
            }

            set_json(
                self.context.cache.as_ref(),
                &self.cache_key,
                &payload,
                self.context.cache_ttl(),
            )
            .await?;
        } else {
            debug!("payload unchanged, skipping renormalization");
        }

        self.context
            .scheduler
            .submit_save(SaveArgs {
                cache_key: Some(self.cache_key.clone()),
                data: None,
                start_time: self.start_time,
                event_id: self.event.event_id.clone(),
                project_id: Some(project_id),
            })
            .await?;
        Ok(())
    }

    async fn enrich(&self, mut payload: Payload) -> Result<Enriched, StoreError> {
        let mut has_changed = false;

        for Step { plugin, step } in self.context.plugins.enhancers(&payload) {
            match step.enhance(self.event, &payload).await {
                PluginResult::Unchanged => {}
                PluginResult::Updated(updated) => {
                    payload = updated;
                    has_changed = true;
                }
                PluginResult::RetryAfter(delay) => return self.retry_later(delay).await,
                PluginResult::Fatal(reason) => step_failed(&plugin, "enhancer", &reason),
            }
        }

        match self
            .context
            .stacktraces
            .process_stacktraces(self.event, &payload)
            .await
        {
            PluginResult::Unchanged => {}
            PluginResult::Updated(updated) => {
                payload = updated;
                has_changed = true;
            }
            PluginResult::RetryAfter(delay) => return self.retry_later(delay).await,
            PluginResult::Fatal(reason) => step_failed("stacktraces", "stacktraces", &reason),
        }

        for Step { plugin, step } in self.context.plugins.preprocessors(&payload) {
            match step.preprocess(self.event, &payload).await {
                PluginResult::Unchanged => {}
                PluginResult::Updated(updated) => {
                    payload = updated;
                    has_changed = true;
                }
                PluginResult::RetryAfter(_) => {
                    step_failed(&plugin, "preprocessor", "preprocessors cannot request a retry")
                }
                PluginResult::Fatal(reason) => step_failed(&plugin, "preprocessor", &reason),
            }
        }

        Ok(Enriched::Done {
            payload,
            has_changed,
        })
    }

    /// Park the stage for `delay`, unless the event already spent too long in
    /// the pipeline. Nothing is written back to the cache.
    async fn retry_later(&self, delay: Duration) -> Result<Enriched, StoreError> {
        let policy = self.context.scheduler.retry_policy();
        if policy.deadline_exceeded(self.start_time, epoch_seconds()) {
            error!(cache_key = %self.cache_key, "process.failed.timeout");
            event_failed("timeout", "process");
            return Err(StoreError::ProcessingDeadlineExceeded {
                event_id: self.event.event_id.clone(),
                limit: policy.max_processing_time,
            });
        }

        info!(delay_secs = delay.as_secs_f64(), "enrichment asked for a retry");
        self.context
            .scheduler
            .submit_retry_process(self.task, self.args(), delay)
            .await?;
        Ok(Enriched::Retrying)
    }

    /// The project's reprocessing revision changed mid-flight: run the whole
    /// pipeline again, and this stage once more on its own.
    async fn restart(&self) -> Result<(), StoreError> {
        let from_reprocessing = self.task == TaskKind::ProcessEventFromReprocessing;
        self.context
            .scheduler
            .submit_preprocess(
                from_reprocessing,
                PreprocessArgs {
                    cache_key: Some(self.cache_key.clone()),
                    data: None,
                    start_time: self.start_time,
                    event_id: self.event.event_id.clone(),
                },
            )
            .await?;
        self.context
            .scheduler
            .submit_process(from_reprocessing, self.args())
            .await?;
        Ok(())
    }
}

fn step_failed(plugin: &str, kind: &'static str, reason: &str) {
    warn!(plugin, kind, "enrichment step failed, skipping: {reason}");
    metrics::counter!(PLUGIN_ERRORS, "plugin" => plugin.to_owned(), "kind" => kind).increment(1);
}
