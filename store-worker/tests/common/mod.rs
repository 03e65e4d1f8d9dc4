#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use serde_json::{json, Value};
use store_common::cache::{BlobCache, CacheError};
use store_common::outcomes::{MemoryOutcomeSink, OutcomeError, OutcomeRecord, OutcomeSink};
use store_common::queue::MemoryTaskQueue;
use store_worker::app_context::{AppContext, Backends};
use store_worker::context::EventContext;
use store_worker::memory::{MemoryQuota, MemoryStore};
use store_worker::payload::Payload;
use store_worker::plugins::{
    Enhancer, Plugin, PluginError, PluginRegistry, PluginResult, Preprocessor,
};
use store_worker::settings::PROCESSING_REVISION;
use store_worker::stacktraces::{NoopStacktraceProcessor, StacktraceProcessor};
use store_worker::test_utils::test_config;
use store_worker::worker::StoreWorker;

mock! {
    pub Stacktraces {}

    #[async_trait]
    impl StacktraceProcessor for Stacktraces {
        fn has_stacktraces(&self, payload: &Payload) -> bool;
        async fn process_stacktraces(&self, context: &EventContext, payload: &Payload) -> PluginResult;
    }
}

/// A plugin offering a fixed set of steps for every payload.
#[derive(Default)]
pub struct StaticPlugin {
    pub enhancers: Vec<Arc<dyn Enhancer>>,
    pub preprocessors: Vec<Arc<dyn Preprocessor>>,
}

impl StaticPlugin {
    pub fn enhancer(enhancer: impl Enhancer + 'static) -> Arc<dyn Plugin> {
        Arc::new(Self {
            enhancers: vec![Arc::new(enhancer)],
            preprocessors: Vec::new(),
        })
    }

    pub fn preprocessor(preprocessor: impl Preprocessor + 'static) -> Arc<dyn Plugin> {
        Arc::new(Self {
            enhancers: Vec::new(),
            preprocessors: vec![Arc::new(preprocessor)],
        })
    }
}

impl Plugin for StaticPlugin {
    fn name(&self) -> &str {
        "static"
    }

    fn enhancers(&self, _payload: &Payload) -> Result<Vec<Arc<dyn Enhancer>>, PluginError> {
        Ok(self.enhancers.clone())
    }

    fn preprocessors(&self, _payload: &Payload) -> Result<Vec<Arc<dyn Preprocessor>>, PluginError> {
        Ok(self.preprocessors.clone())
    }
}

/// Sets a tag on every event.
pub struct Tagger;

#[async_trait]
impl Enhancer for Tagger {
    async fn enhance(&self, _context: &EventContext, payload: &Payload) -> PluginResult {
        let mut payload = payload.clone();
        payload.insert("tags", json!([["enhanced", "yes"]]));
        PluginResult::Updated(payload)
    }
}

/// Asks for the stage to run again later.
pub struct Retrying(pub Duration);

#[async_trait]
impl Enhancer for Retrying {
    async fn enhance(&self, _context: &EventContext, _payload: &Payload) -> PluginResult {
        PluginResult::RetryAfter(self.0)
    }
}

/// Reports a missing debug file for every event.
pub struct MissingDebugFile;

pub fn missing_debug_file_issue() -> Value {
    json!({
        "scope": "native",
        "object": "dsym:8f3e",
        "type": "native_missing_dsym",
        "data": {"image_path": "/usr/lib/libapp.dylib"},
    })
}

#[async_trait]
impl Enhancer for MissingDebugFile {
    async fn enhance(&self, _context: &EventContext, payload: &Payload) -> PluginResult {
        let mut payload = payload.clone();
        payload.insert(
            "processing_issues",
            json!({"native_missing_dsym:dsym:8f3e": missing_debug_file_issue()}),
        );
        PluginResult::Updated(payload)
    }
}

/// Reports an issue and, while doing so, bumps the project's reprocessing
/// revision, as a concurrent configuration change would. The store is handed
/// over once the harness owning it exists.
#[derive(Clone, Default)]
pub struct RevisionBump {
    pub store: Arc<OnceLock<Arc<MemoryStore>>>,
}

#[async_trait]
impl Enhancer for RevisionBump {
    async fn enhance(&self, context: &EventContext, payload: &Payload) -> PluginResult {
        if let Some(store) = self.store.get() {
            store.set_option(context.project_id, PROCESSING_REVISION, json!("r2"));
        }
        MissingDebugFile.enhance(context, payload).await
    }
}

/// Moves the event to another project, which no step may do.
pub struct ProjectMover;

#[async_trait]
impl Preprocessor for ProjectMover {
    async fn preprocess(&self, _context: &EventContext, payload: &Payload) -> PluginResult {
        let mut payload = payload.clone();
        payload.insert("project", json!(999));
        PluginResult::Updated(payload)
    }
}

/// Asks for a retry, which preprocessors may not do.
pub struct RetryingPreprocessor;

#[async_trait]
impl Preprocessor for RetryingPreprocessor {
    async fn preprocess(&self, _context: &EventContext, _payload: &Payload) -> PluginResult {
        PluginResult::RetryAfter(Duration::from_secs(30))
    }
}

/// Takes longer than any test time limit.
pub struct Slow;

#[async_trait]
impl Enhancer for Slow {
    async fn enhance(&self, _context: &EventContext, _payload: &Payload) -> PluginResult {
        tokio::time::sleep(Duration::from_millis(500)).await;
        PluginResult::Unchanged
    }
}

/// Always fails internally.
pub struct Broken;

#[async_trait]
impl Enhancer for Broken {
    async fn enhance(&self, _context: &EventContext, _payload: &Payload) -> PluginResult {
        PluginResult::Fatal("symbol server unreachable".to_owned())
    }
}

pub fn event(event_id: &str, project_id: i64) -> Value {
    json!({
        "event_id": event_id,
        "project": project_id,
        "platform": "cocoa",
        "timestamp": store_worker::epoch_seconds() - 5.0,
        "message": "Attempt to dereference a null pointer",
    })
}

/// Fails the first outcome it is handed and records the rest.
#[derive(Default)]
pub struct FlakyOnce {
    failed: AtomicBool,
    pub sink: MemoryOutcomeSink,
}

#[async_trait]
impl OutcomeSink for FlakyOnce {
    async fn record(&self, outcome: OutcomeRecord) -> Result<(), OutcomeError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(OutcomeError::Database(sqlx::Error::PoolTimedOut));
        }
        self.sink.record(outcome).await
    }
}

/// A cache whose server is gone.
pub struct BrokenCache;

fn connection_refused() -> CacheError {
    CacheError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl BlobCache for BrokenCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(connection_refused())
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
        Err(connection_refused())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(connection_refused())
    }
}

/// Memory backends behind a given cache and outcome sink. Tasks get a 200ms
/// time limit and are redelivered as soon as their lease runs out.
pub struct ShortLease {
    pub context: Arc<AppContext>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub quota: Arc<MemoryQuota>,
}

impl ShortLease {
    pub fn new(
        overrides: &[(&str, &str)],
        cache: Arc<dyn BlobCache>,
        outcomes: Arc<dyn OutcomeSink>,
    ) -> Self {
        let mut env = vec![("DEFAULT_TIME_LIMIT", "200")];
        env.extend_from_slice(overrides);
        let config = test_config(&env);

        let store = Arc::new(MemoryStore::default());
        let queue = Arc::new(MemoryTaskQueue::new(Duration::ZERO));
        let quota = Arc::new(MemoryQuota::default());
        store.add_project(1, 10);

        let backends = Backends {
            cache,
            queue: queue.clone(),
            settings: store.clone(),
            storage: store.clone(),
            committer: store.clone(),
            quotas: quota.clone(),
            outcomes,
        };
        let context = AppContext::from_backends(
            &config,
            backends,
            PluginRegistry::new(),
            Arc::new(NoopStacktraceProcessor),
        );

        Self {
            context: Arc::new(context),
            store,
            queue,
            quota,
        }
    }

    pub fn worker(&self) -> StoreWorker {
        StoreWorker::new(self.context.clone())
    }

    /// Wait out the lease of every task handed out so far.
    pub async fn expire_leases(&self) {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}
