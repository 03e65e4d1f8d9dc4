use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::StorageError;
use crate::settings::{Project, ProjectKey};

/// Rate limit accounting. Events that are dropped after being counted get
/// their quota back.
#[async_trait]
pub trait Quota: Send + Sync {
    async fn refund(
        &self,
        project: &Project,
        key: Option<&ProjectKey>,
        timestamp: Option<f64>,
    ) -> Result<(), StorageError>;
}

pub struct NoopQuota;

#[async_trait]
impl Quota for NoopQuota {
    async fn refund(
        &self,
        project: &Project,
        key: Option<&ProjectKey>,
        _timestamp: Option<f64>,
    ) -> Result<(), StorageError> {
        debug!(
            project = project.id,
            key = key.map(|k| k.id),
            "quota refund ignored"
        );
        Ok(())
    }
}

/// Counts refunds in redis, per project and per key, bucketed by quota window.
pub struct RedisQuota {
    connection: MultiplexedConnection,
    window: Duration,
}

impl RedisQuota {
    pub async fn new(url: &str, window: Duration) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { connection, window })
    }
}

/// Refund counter keys for an event seen at `timestamp`.
pub fn refund_keys(
    project: &Project,
    key: Option<&ProjectKey>,
    timestamp: f64,
    window: Duration,
) -> Vec<String> {
    let window = window.as_secs().max(1);
    let bucket = timestamp.max(0.0) as u64 / window;

    let mut keys = vec![format!("quota:refund:p:{}:{bucket}", project.id)];
    if let Some(key) = key {
        keys.push(format!("quota:refund:k:{}:{bucket}", key.id));
    }
    keys
}

#[async_trait]
impl Quota for RedisQuota {
    async fn refund(
        &self,
        project: &Project,
        key: Option<&ProjectKey>,
        timestamp: Option<f64>,
    ) -> Result<(), StorageError> {
        let timestamp = timestamp.unwrap_or_else(crate::epoch_seconds);
        let expiry = i64::try_from(self.window.as_secs().max(1) * 2).unwrap_or(i64::MAX);
        let mut conn = self.connection.clone();

        for refund_key in refund_keys(project, key, timestamp, self.window) {
            conn.incr::<_, _, ()>(&refund_key, 1).await?;
            conn.expire::<_, ()>(&refund_key, expiry).await?;
        }
        Ok(())
    }
}
