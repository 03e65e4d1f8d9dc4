use async_trait::async_trait;
use serde_json::Value;

use crate::context::EventContext;
use crate::payload::Payload;
use crate::plugins::PluginResult;

/// Stack trace resolution (symbolication), run once per process stage.
#[async_trait]
pub trait StacktraceProcessor: Send + Sync {
    /// Whether the payload holds stack traces this processor would work on.
    fn has_stacktraces(&self, payload: &Payload) -> bool;

    async fn process_stacktraces(&self, context: &EventContext, payload: &Payload)
        -> PluginResult;
}

/// Used when no symbolication backend is configured.
pub struct NoopStacktraceProcessor;

#[async_trait]
impl StacktraceProcessor for NoopStacktraceProcessor {
    fn has_stacktraces(&self, _payload: &Payload) -> bool {
        false
    }

    async fn process_stacktraces(
        &self,
        _context: &EventContext,
        _payload: &Payload,
    ) -> PluginResult {
        PluginResult::Unchanged
    }
}

/// Every stack trace object in the payload: the top level one, and the ones
/// under exception and thread values.
pub fn stacktraces_mut(payload: &mut Payload) -> Vec<&mut Value> {
    let mut found = Vec::new();
    for (key, value) in payload.as_map_mut().iter_mut() {
        match key.as_str() {
            "stacktrace" if value.is_object() => found.push(value),
            "exception" | "threads" => {
                if let Some(Value::Array(values)) = value.get_mut("values") {
                    for entry in values.iter_mut() {
                        if let Some(stacktrace) = entry.get_mut("stacktrace") {
                            if stacktrace.is_object() {
                                found.push(stacktrace);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    found
}
