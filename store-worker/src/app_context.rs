use std::sync::Arc;
use std::time::Duration;

use health::{HealthHandle, HealthRegistry};
use sqlx::postgres::PgPoolOptions;
use store_common::cache::{BlobCache, MemoryBlobCache, RedisBlobCache};
use store_common::outcomes::{LogOutcomeSink, OutcomeSink, PgOutcomeSink};
use store_common::queue::{MemoryTaskQueue, PgTaskQueue, TaskQueue};
use store_common::retry::RetryPolicy;
use tracing::info;

use crate::commit::EventCommitter;
use crate::config::{Backend, Config};
use crate::error::WorkerError;
use crate::memory::MemoryStore;
use crate::normalize::Normalizer;
use crate::pg::PgStore;
use crate::plugins::PluginRegistry;
use crate::quotas::{NoopQuota, Quota, RedisQuota};
use crate::settings::{Settings, SettingsStore};
use crate::stacktraces::{NoopStacktraceProcessor, StacktraceProcessor};
use crate::storage::Storage;
use crate::tasks::Scheduler;

/// Everything a stage needs, shared by all tasks a worker runs.
pub struct AppContext {
    pub health_registry: HealthRegistry,
    pub worker_liveness: HealthHandle,
    pub cache: Arc<dyn BlobCache>,
    pub queue: Arc<dyn TaskQueue>,
    pub scheduler: Scheduler,
    pub plugins: PluginRegistry,
    pub stacktraces: Arc<dyn StacktraceProcessor>,
    pub settings: Settings,
    pub storage: Arc<dyn Storage>,
    pub committer: Arc<dyn EventCommitter>,
    pub quotas: Arc<dyn Quota>,
    pub outcomes: Arc<dyn OutcomeSink>,
    pub config: Config,
}

/// The collaborators an `AppContext` is assembled from.
pub struct Backends {
    pub cache: Arc<dyn BlobCache>,
    pub queue: Arc<dyn TaskQueue>,
    pub settings: Arc<dyn SettingsStore>,
    pub storage: Arc<dyn Storage>,
    pub committer: Arc<dyn EventCommitter>,
    pub quotas: Arc<dyn Quota>,
    pub outcomes: Arc<dyn OutcomeSink>,
}

pub fn retry_policy(config: &Config) -> RetryPolicy {
    let mut builder = RetryPolicy::build(Duration::from_secs(
        config.retry_policy.max_processing_secs,
    ))
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .max_attempts(config.retry_policy.max_attempts);
    if let Some(queue) = &config.retry_policy.retry_queue_name {
        builder = builder.queue(queue.as_str());
    }
    builder.provide()
}

impl AppContext {
    /// Connect the backends selected by `config`. Plugins and stack trace
    /// processing are registered by the embedding binary.
    pub async fn new(
        config: &Config,
        plugins: PluginRegistry,
        stacktraces: Arc<dyn StacktraceProcessor>,
    ) -> Result<Self, WorkerError> {
        let cache: Arc<dyn BlobCache> = match &config.redis_url {
            Some(url) => Arc::new(RedisBlobCache::new(url.as_str()).await?),
            None => Arc::new(MemoryBlobCache::new(config.memory_cache_entries)),
        };

        let quotas: Arc<dyn Quota> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisQuota::new(
                    url.as_str(),
                    Duration::from_secs(config.quota_window_secs),
                )
                .await?,
            ),
            None => Arc::new(NoopQuota),
        };

        let backends = match config.backend {
            Backend::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_pg_connections)
                    .connect(&config.database_url)
                    .await?;
                let store = Arc::new(PgStore::new(pool.clone()));
                Backends {
                    cache,
                    queue: Arc::new(PgTaskQueue::new_from_pool(pool.clone())),
                    settings: store.clone(),
                    storage: store.clone(),
                    committer: store,
                    quotas,
                    outcomes: Arc::new(PgOutcomeSink::new(pool)),
                }
            }
            Backend::Memory => {
                let store = Arc::new(MemoryStore::default());
                Backends {
                    cache,
                    queue: Arc::new(MemoryTaskQueue::default()),
                    settings: store.clone(),
                    storage: store.clone(),
                    committer: store,
                    quotas,
                    outcomes: Arc::new(LogOutcomeSink),
                }
            }
        };

        info!(
            backend = ?config.backend,
            redis = config.redis_url.is_some(),
            queues = ?config.queues.0,
            "AppContext initialized"
        );

        Ok(Self::from_backends(config, backends, plugins, stacktraces))
    }

    pub fn from_backends(
        config: &Config,
        backends: Backends,
        plugins: PluginRegistry,
        stacktraces: Arc<dyn StacktraceProcessor>,
    ) -> Self {
        let health_registry = HealthRegistry::new("liveness");
        let worker_liveness = health_registry.register("worker", Duration::from_secs(60));

        let scheduler = Scheduler::new(
            backends.queue.clone(),
            retry_policy(config),
            config.default_time_limit.0,
        );
        let settings = Settings::new(
            backends.settings,
            config.settings_cache_size,
            Duration::from_secs(config.settings_cache_ttl_secs),
        );

        Self {
            health_registry,
            worker_liveness,
            cache: backends.cache,
            queue: backends.queue,
            scheduler,
            plugins,
            stacktraces,
            settings,
            storage: backends.storage,
            committer: backends.committer,
            quotas: backends.quotas,
            outcomes: backends.outcomes,
            config: config.clone(),
        }
    }

    /// A context without plugins or stack trace processing.
    pub async fn without_plugins(config: &Config) -> Result<Self, WorkerError> {
        Self::new(
            config,
            PluginRegistry::new(),
            Arc::new(NoopStacktraceProcessor),
        )
        .await
    }

    /// A renormalizer anchored at the current time.
    pub fn normalizer(&self) -> Normalizer {
        Normalizer::renormalize(self.config.normalizer(), crate::epoch_seconds())
    }

    pub fn cache_ttl(&self) -> Duration {
        self.config.cache_ttl()
    }
}
