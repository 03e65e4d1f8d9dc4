//! The three pipeline stages. Each runs as its own task, reads the event's
//! payload inline or from the blob cache, and hands off to the next stage
//! through the scheduler.
use store_common::cache::{get_json, CacheError};
use tracing::warn;

use crate::app_context::AppContext;
use crate::error::StoreError;
use crate::metric_consts::EVENTS_FAILED;
use crate::payload::Payload;

mod preprocess;
mod process;
mod save;

pub use preprocess::preprocess_event;
pub use process::process_event;
pub use save::save_event;

/// Count an event that left the pipeline without reaching a terminal record.
pub fn event_failed(reason: &'static str, stage: &'static str) {
    metrics::counter!(EVENTS_FAILED, "reason" => reason, "stage" => stage).increment(1);
}

/// The payload a stage works on. An inline payload wins over the cache. A
/// missing or unreadable cache entry reads as `None`.
pub async fn load_payload(
    context: &AppContext,
    cache_key: Option<&str>,
    data: Option<Payload>,
) -> Result<Option<Payload>, StoreError> {
    if let Some(data) = data {
        return Ok(Some(data));
    }
    let Some(cache_key) = cache_key else {
        return Ok(None);
    };

    match get_json::<Payload>(context.cache.as_ref(), cache_key).await {
        Ok(payload) => Ok(payload),
        Err(CacheError::Serde(err)) => {
            warn!(cache_key, "discarding unreadable cached payload: {err}");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}
