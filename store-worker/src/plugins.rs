//! Runtime-registered plugins that enrich events during processing.
//!
//! A plugin offers enhancers and preprocessors for a given payload. Both run
//! in registration order during the process stage; enhancers first, then the
//! stack trace step, then preprocessors.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

use crate::context::EventContext;
use crate::metric_consts::PLUGIN_ERRORS;
use crate::payload::Payload;

/// What a single enrichment step did with the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginResult {
    Unchanged,
    /// Replace the payload wholesale.
    Updated(Payload),
    /// A transient failure: run the process stage again after the delay.
    RetryAfter(Duration),
    /// An internal failure of the step. The step is skipped.
    Fatal(String),
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct PluginError(pub String);

#[async_trait]
pub trait Enhancer: Send + Sync {
    async fn enhance(&self, context: &EventContext, payload: &Payload) -> PluginResult;
}

#[async_trait]
pub trait Preprocessor: Send + Sync {
    async fn preprocess(&self, context: &EventContext, payload: &Payload) -> PluginResult;
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn enhancers(&self, _payload: &Payload) -> Result<Vec<Arc<dyn Enhancer>>, PluginError> {
        Ok(Vec::new())
    }

    fn preprocessors(
        &self,
        _payload: &Payload,
    ) -> Result<Vec<Arc<dyn Preprocessor>>, PluginError> {
        Ok(Vec::new())
    }
}

/// An enrichment step together with the plugin that offered it.
pub struct Step<T: ?Sized> {
    pub plugin: String,
    pub step: Arc<T>,
}

#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Enhancers applicable to `payload`. A plugin that fails to answer
    /// contributes nothing; the failure is logged and counted.
    pub fn enhancers(&self, payload: &Payload) -> Vec<Step<dyn Enhancer>> {
        self.collect("enhancers", payload, |plugin, payload| {
            plugin.enhancers(payload)
        })
    }

    /// Preprocessors applicable to `payload`, with the same failure handling
    /// as `enhancers`.
    pub fn preprocessors(&self, payload: &Payload) -> Vec<Step<dyn Preprocessor>> {
        self.collect("preprocessors", payload, |plugin, payload| {
            plugin.preprocessors(payload)
        })
    }

    /// Whether any plugin wants to look at `payload`.
    pub fn wants(&self, payload: &Payload) -> bool {
        !self.enhancers(payload).is_empty() || !self.preprocessors(payload).is_empty()
    }

    fn collect<T, F>(&self, kind: &'static str, payload: &Payload, discover: F) -> Vec<Step<T>>
    where
        T: ?Sized,
        F: Fn(&dyn Plugin, &Payload) -> Result<Vec<Arc<T>>, PluginError>,
    {
        let mut steps = Vec::new();
        for plugin in &self.plugins {
            match discover(plugin.as_ref(), payload) {
                Ok(found) => steps.extend(found.into_iter().map(|step| Step {
                    plugin: plugin.name().to_owned(),
                    step,
                })),
                Err(err) => {
                    error!(plugin = plugin.name(), kind, "failed to list plugin steps: {err}");
                    metrics::counter!(PLUGIN_ERRORS, "plugin" => plugin.name().to_owned(), "kind" => kind)
                        .increment(1);
                }
            }
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Tagger;

    #[async_trait]
    impl Enhancer for Tagger {
        async fn enhance(&self, _context: &EventContext, payload: &Payload) -> PluginResult {
            let mut payload = payload.clone();
            payload.insert("tagged", json!(true));
            PluginResult::Updated(payload)
        }
    }

    struct NativeOnly;

    impl Plugin for NativeOnly {
        fn name(&self) -> &str {
            "native-only"
        }

        fn enhancers(&self, payload: &Payload) -> Result<Vec<Arc<dyn Enhancer>>, PluginError> {
            if payload.platform() == "native" {
                Ok(vec![Arc::new(Tagger)])
            } else {
                Ok(Vec::new())
            }
        }
    }

    struct Broken;

    impl Plugin for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn enhancers(&self, _payload: &Payload) -> Result<Vec<Arc<dyn Enhancer>>, PluginError> {
            Err(PluginError("config missing".to_owned()))
        }
    }

    #[test]
    fn discovery_filters_by_payload() {
        let registry = PluginRegistry::new().register(Arc::new(NativeOnly));

        let native = Payload::from_value(json!({"platform": "native"})).unwrap();
        let python = Payload::from_value(json!({"platform": "python"})).unwrap();

        let steps = registry.enhancers(&native);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].plugin, "native-only");
        assert!(registry.wants(&native));
        assert!(!registry.wants(&python));
    }

    #[test]
    fn failing_discovery_yields_nothing() {
        let registry = PluginRegistry::new()
            .register(Arc::new(Broken))
            .register(Arc::new(NativeOnly));
        let native = Payload::from_value(json!({"platform": "native"})).unwrap();

        let steps = registry.enhancers(&native);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].plugin, "native-only");

        let broken_only = PluginRegistry::new().register(Arc::new(Broken));
        assert!(broken_only.enhancers(&native).is_empty());
        assert!(!broken_only.wants(&native));
    }

    #[tokio::test]
    async fn enhancer_replaces_payload() {
        let context = EventContext::new(1, Some("e1"));
        let payload = Payload::from_value(json!({"platform": "native"})).unwrap();

        match Tagger.enhance(&context, &payload).await {
            PluginResult::Updated(updated) => assert_eq!(updated.get("tagged"), Some(&json!(true))),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
