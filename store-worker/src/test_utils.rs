//! Test utilities for running the pipeline against in-memory backends.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use serde_json::Value;
use store_common::cache::{get_json, set_json, BlobCache, MemoryBlobCache};
use store_common::outcomes::MemoryOutcomeSink;
use store_common::queue::MemoryTaskQueue;

use crate::app_context::{AppContext, Backends};
use crate::config::Config;
use crate::context::EventContext;
use crate::memory::{MemoryQuota, MemoryStore};
use crate::payload::Payload;
use crate::plugins::{PluginRegistry, PluginResult};
use crate::stacktraces::{stacktraces_mut, NoopStacktraceProcessor, StacktraceProcessor};
use crate::worker::StoreWorker;

/// A config for the memory backend, with `overrides` applied on top of the
/// defaults.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = HashMap::from([
        ("BACKEND".to_owned(), "memory".to_owned()),
        ("POLL_INTERVAL".to_owned(), "10".to_owned()),
    ]);
    for (key, value) in overrides {
        env.insert((*key).to_owned(), (*value).to_owned());
    }
    Config::init_from_hashmap(&env).unwrap()
}

/// Reports stack traces whenever the payload has any, and leaves them as they are.
pub struct StacktraceDetector;

#[async_trait]
impl StacktraceProcessor for StacktraceDetector {
    fn has_stacktraces(&self, payload: &Payload) -> bool {
        !stacktraces_mut(&mut payload.clone()).is_empty()
    }

    async fn process_stacktraces(
        &self,
        _context: &EventContext,
        _payload: &Payload,
    ) -> PluginResult {
        PluginResult::Unchanged
    }
}

/// An `AppContext` wired to in-memory backends, with handles on each backend
/// for inspection.
pub struct TestHarness {
    pub context: Arc<AppContext>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub cache: Arc<MemoryBlobCache>,
    pub outcomes: Arc<MemoryOutcomeSink>,
    pub quota: Arc<MemoryQuota>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_plugins(PluginRegistry::new(), Arc::new(NoopStacktraceProcessor))
    }

    pub fn with_stacktraces() -> Self {
        Self::with_plugins(PluginRegistry::new(), Arc::new(StacktraceDetector))
    }

    pub fn with_plugins(
        plugins: PluginRegistry,
        stacktraces: Arc<dyn StacktraceProcessor>,
    ) -> Self {
        Self::with_config(test_config(&[]), plugins, stacktraces)
    }

    pub fn with_config(
        config: Config,
        plugins: PluginRegistry,
        stacktraces: Arc<dyn StacktraceProcessor>,
    ) -> Self {
        let store = Arc::new(MemoryStore::default());
        let queue = Arc::new(MemoryTaskQueue::default());
        let cache = Arc::new(MemoryBlobCache::default());
        let outcomes = Arc::new(MemoryOutcomeSink::default());
        let quota = Arc::new(MemoryQuota::default());

        let backends = Backends {
            cache: cache.clone(),
            queue: queue.clone(),
            settings: store.clone(),
            storage: store.clone(),
            committer: store.clone(),
            quotas: quota.clone(),
            outcomes: outcomes.clone(),
        };
        let context = AppContext::from_backends(&config, backends, plugins, stacktraces);

        Self {
            context: Arc::new(context),
            store,
            queue,
            cache,
            outcomes,
            quota,
        }
    }

    pub fn worker(&self) -> StoreWorker {
        StoreWorker::new(self.context.clone())
    }

    pub async fn cache_payload(&self, cache_key: &str, payload: Value) {
        set_json(
            self.cache.as_ref(),
            cache_key,
            &payload,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
    }

    pub async fn cached_payload(&self, cache_key: &str) -> Option<Payload> {
        get_json(self.cache.as_ref(), cache_key).await.unwrap()
    }

    /// The raw cached bytes, for byte-for-byte comparisons.
    pub async fn cached_bytes(&self, cache_key: &str) -> Option<Vec<u8>> {
        self.cache.get(cache_key).await.unwrap()
    }
}
