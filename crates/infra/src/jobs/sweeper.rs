//! Periodic promotion of due delayed jobs onto the ready queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::store::{JobStore, JobStoreError};

/// Floor applied to the sweep interval; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);
use crate::workers::{self, WorkerHandle};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Upper bound on jobs moved per sweep
    pub batch_size: usize,
    /// Name for logging
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            name: "promotion-sweeper".to_string(),
        }
    }
}

impl SweeperConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Moves due delayed jobs to the ready queue on a fixed interval.
///
/// Any number of sweepers may run against one store; promotion is atomic
/// per job, so a job is never promoted twice.
pub struct PromotionSweeper {
    store: Arc<dyn JobStore>,
    config: SweeperConfig,
}

impl PromotionSweeper {
    pub fn new(store: Arc<dyn JobStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    /// One sweep at `now`. Returns how many jobs were promoted.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let moved = self.store.promote_due(now, self.config.batch_size.max(1)).await?;
        if moved > 0 {
            debug!(sweeper = %self.config.name, moved, "promoted due jobs");
        }
        Ok(moved)
    }

    /// Run in a background task until the handle is shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = workers::shutdown_channel();
        let mut handle = WorkerHandle::new(self.config.name.clone(), shutdown_tx);

        handle.push(tokio::spawn(async move {
            info!(sweeper = %self.config.name, interval_ms = self.config.interval.as_millis() as u64, "sweeper started");

            let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = workers::stopped(&mut shutdown_rx) => break,
                    _ = ticker.tick() => {
                        // Store errors never stop the sweeper; the next tick retries.
                        if let Err(e) = self.sweep_once(Utc::now()).await {
                            error!(sweeper = %self.config.name, error = %e, "sweep failed");
                        }
                    }
                }
            }

            info!(sweeper = %self.config.name, "sweeper stopped");
        }));

        handle
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::store::contract::job;
    use crate::jobs::types::{DeadLetterRecord, Job, RequeueOutcome};
    use courier_core::JobId;

    #[tokio::test]
    async fn sweep_once_moves_only_due_jobs_up_to_batch() {
        let store = InMemoryJobStore::arc();
        let now = Utc::now();
        for i in 0..5 {
            store
                .schedule_delayed(&job(&i.to_string()), now - chrono::Duration::seconds(1))
                .await
                .unwrap();
        }
        store
            .schedule_delayed(&job("future"), now + chrono::Duration::hours(1))
            .await
            .unwrap();

        let sweeper = PromotionSweeper::new(store.clone(), SweeperConfig::default().with_batch_size(3));
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 3);
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 2);
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 0);

        assert_eq!(store.ready_len().await.unwrap(), 5);
        assert_eq!(store.delayed_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn zero_interval_and_batch_still_promote() {
        let store = InMemoryJobStore::arc();
        store
            .schedule_delayed(&job("due"), Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        let config = SweeperConfig::default()
            .with_interval(Duration::ZERO)
            .with_batch_size(0);
        let handle = PromotionSweeper::new(store.clone(), config).spawn();

        for _ in 0..100 {
            if store.ready_len().await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        assert_eq!(store.ready_len().await.unwrap(), 1);
        assert_eq!(store.delayed_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_promotes_until_shutdown() {
        let store = InMemoryJobStore::arc();
        store
            .schedule_delayed(&job("a"), Utc::now() + chrono::Duration::milliseconds(50))
            .await
            .unwrap();

        let handle = PromotionSweeper::new(
            store.clone(),
            SweeperConfig::default().with_interval(Duration::from_millis(10)),
        )
        .spawn();

        let mut promoted = false;
        for _ in 0..100 {
            if store.ready_len().await.unwrap() == 1 {
                promoted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(promoted);
        assert_eq!(store.delayed_len().await.unwrap(), 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl JobStore for BrokenStore {
        async fn push_ready(&self, _: &Job) -> Result<(), JobStoreError> {
            unreachable!()
        }
        async fn pop_ready(&self) -> Result<Option<Job>, JobStoreError> {
            unreachable!()
        }
        async fn schedule_delayed(&self, _: &Job, _: DateTime<Utc>) -> Result<(), JobStoreError> {
            unreachable!()
        }
        async fn promote_due(&self, _: DateTime<Utc>, _: usize) -> Result<usize, JobStoreError> {
            Err(JobStoreError::Connection("refused".into()))
        }
        async fn archive_dead(&self, _: Job, _: Option<String>) -> Result<(), JobStoreError> {
            unreachable!()
        }
        async fn list_dead(&self, _: usize) -> Result<Vec<DeadLetterRecord>, JobStoreError> {
            unreachable!()
        }
        async fn requeue_dead(&self, _: JobId) -> Result<RequeueOutcome, JobStoreError> {
            unreachable!()
        }
        async fn ready_len(&self) -> Result<u64, JobStoreError> {
            unreachable!()
        }
        async fn delayed_len(&self) -> Result<u64, JobStoreError> {
            unreachable!()
        }
        async fn dead_len(&self) -> Result<u64, JobStoreError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn store_errors_do_not_kill_the_sweeper() {
        let sweeper = PromotionSweeper::new(
            Arc::new(BrokenStore),
            SweeperConfig::default().with_interval(Duration::from_millis(5)),
        );
        assert!(sweeper.sweep_once(Utc::now()).await.is_err());

        let handle = sweeper.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Shutdown still completes cleanly after repeated failures.
        handle.shutdown().await;
    }
}
