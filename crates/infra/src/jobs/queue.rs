//! Producer-facing facade over a `JobStore`, plus backend selection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use courier_core::{DomainError, JobId};

use super::store::{InMemoryJobStore, JobStore, JobStoreError};
use super::types::{DeadLetterRecord, Job, JobType, Payload, QueueMetrics, RequeueOutcome};
use crate::config::QueueConfig;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("queue backend unavailable: {0}")]
    Backend(String),
}

/// Which store backs a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Redis,
    InMemory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Redis => "redis",
            Self::InMemory => "in_memory",
        })
    }
}

/// The enqueue side used by booking and payment flows, and the read/recover
/// side used by operators.
///
/// Clones share the same store.
#[derive(Clone)]
pub struct NotificationQueue {
    store: Arc<dyn JobStore>,
    backend: BackendKind,
}

impl std::fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueue")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl NotificationQueue {
    pub fn new(store: Arc<dyn JobStore>, backend: BackendKind) -> Self {
        Self { store, backend }
    }

    pub fn in_memory() -> Self {
        Self::new(InMemoryJobStore::arc(), BackendKind::InMemory)
    }

    /// Pick a backend from configuration.
    ///
    /// With `redis_url` set, connects and PINGs; an unreachable Redis is an
    /// error, never a silent switch to process-local storage. Without
    /// `redis_url` the in-process store is used, unless `require_redis` is set.
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let Some(url) = config.redis_url.as_deref() else {
            if config.require_redis {
                return Err(QueueError::Backend(
                    "COURIER_REQUIRE_REDIS is set but REDIS_URL is not".to_string(),
                ));
            }
            warn!("REDIS_URL not set; notifications are kept in process memory only");
            return Ok(Self::in_memory());
        };

        let store = connect_redis(url, &config.key_prefix)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        info!(prefix = %config.key_prefix, "notification queue backed by redis");
        Ok(Self::new(store, BackendKind::Redis))
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Enqueue for immediate dispatch.
    pub async fn enqueue(&self, job_type: &str, payload: Payload) -> Result<JobId, QueueError> {
        let job = Job::new(JobType::new(job_type)?, payload);
        self.store.push_ready(&job).await?;
        info!(job_id = %job.id, job_type = %job.job_type, "notification enqueued");
        Ok(job.id)
    }

    /// Enqueue for dispatch no earlier than `delay` from now.
    ///
    /// A zero delay is the same as `enqueue`.
    pub async fn enqueue_delayed(
        &self,
        job_type: &str,
        payload: Payload,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        if delay.is_zero() {
            return self.enqueue(job_type, payload).await;
        }

        let job = Job::new(JobType::new(job_type)?, payload);
        let delay = chrono::Duration::from_std(delay)
            .map_err(|_| DomainError::validation("delay is too large"))?;
        let eligible_at = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| DomainError::validation("delay is too large"))?;

        self.store.schedule_delayed(&job, eligible_at).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            eligible_at = %eligible_at,
            "notification scheduled"
        );
        Ok(job.id)
    }

    pub async fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        Ok(self.store.metrics().await?)
    }

    pub async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, QueueError> {
        Ok(self.store.list_dead(limit).await?)
    }

    pub async fn requeue_dead(&self, job_id: JobId) -> Result<RequeueOutcome, QueueError> {
        let outcome = self.store.requeue_dead(job_id).await?;
        if outcome.ok {
            info!(job_id = %job_id, "dead letter requeued by operator");
        }
        Ok(outcome)
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str, prefix: &str) -> Result<Arc<dyn JobStore>, JobStoreError> {
    let store = super::redis_store::RedisJobStore::connect(url, Some(prefix)).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str, _prefix: &str) -> Result<Arc<dyn JobStore>, JobStoreError> {
    Err(JobStoreError::Connection(
        "built without the redis feature".to_string(),
    ))
}
