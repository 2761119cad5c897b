//! Notification job queue with delayed retry and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs carry an explicit id, a type tag and an opaque payload
//! - Retry policy with exponential, capped backoff, applied only by the dispatcher
//! - Dead-letter store indexed by job id, recoverable by operator requeue
//! - Same semantics on Redis and in-memory backends
//!
//! ## Components
//!
//! - `Job`: the unit of work
//! - `JobStore`: ready queue, delayed set and dead-letter primitives
//! - `PromotionSweeper`: moves due delayed jobs onto the ready queue
//! - `Dispatcher`: delivers ready jobs through a `Notifier`
//! - `NotificationQueue`: producer and operator facade

pub mod dispatcher;
pub mod notifier;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod sweeper;
pub mod types;

/// Default key prefix for all queue structures.
pub const DEFAULT_KEY_PREFIX: &str = "courier:notifications";

pub use dispatcher::{
    DispatchOutcome, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats,
    DispatcherStatsHandle,
};
pub use notifier::{DeliveryError, LogNotifier, Notifier, NotifierRouter, WebhookNotifier};
pub use queue::{BackendKind, NotificationQueue, QueueError};
#[cfg(feature = "redis")]
pub use redis_store::{RedisJobStore, RedisKeys};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use sweeper::{PromotionSweeper, SweeperConfig};
pub use types::{
    BackoffStrategy, DeadLetterRecord, Job, JobType, Payload, QueueMetrics, RequeueOutcome,
    RetryPolicy,
};
