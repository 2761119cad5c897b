//! Job storage: the atomic primitives shared by producers, sweepers and dispatchers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use courier_core::JobId;

use super::types::{DeadLetterRecord, Job, QueueMetrics, RequeueOutcome};

/// Job store abstraction.
///
/// Every method is a single indivisible operation against the backing store.
/// Callers never combine reads and writes to emulate one of these; that is
/// what keeps many processes safe against the same store.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Append a job to the ready queue.
    async fn push_ready(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Atomically remove the oldest ready job (FIFO with `push_ready`).
    async fn pop_ready(&self) -> Result<Option<Job>, JobStoreError>;

    /// Insert a job into the delayed set, eligible from `eligible_at`.
    async fn schedule_delayed(
        &self,
        job: &Job,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Move up to `max_batch` delayed jobs with `eligible_at <= now` to the
    /// ready queue, earliest first. Returns how many were moved.
    async fn promote_due(&self, now: DateTime<Utc>, max_batch: usize)
    -> Result<usize, JobStoreError>;

    /// Archive a job that exhausted its retries.
    async fn archive_dead(&self, job: Job, reason: Option<String>) -> Result<(), JobStoreError>;

    /// Dead-letter records, newest first, at most `limit`.
    async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, JobStoreError>;

    /// Remove the dead-letter record for `job_id` and push its job, with its
    /// attempt count unchanged, back onto the ready queue.
    async fn requeue_dead(&self, job_id: JobId) -> Result<RequeueOutcome, JobStoreError>;

    async fn ready_len(&self) -> Result<u64, JobStoreError>;

    async fn delayed_len(&self) -> Result<u64, JobStoreError>;

    async fn dead_len(&self) -> Result<u64, JobStoreError>;

    /// Lengths of all three stores.
    async fn metrics(&self) -> Result<QueueMetrics, JobStoreError> {
        Ok(QueueMetrics {
            ready_length: self.ready_len().await?,
            delayed_length: self.delayed_len().await?,
            dead_length: self.dead_len().await?,
        })
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct QueueState {
    /// Front is the oldest job.
    ready: VecDeque<Job>,
    /// Keyed by (eligible_at millis, insertion sequence) so equal scores keep
    /// their insertion order.
    delayed: BTreeMap<(i64, u64), Job>,
    next_seq: u64,
    /// Front is the newest record.
    dead: VecDeque<DeadLetterRecord>,
}

/// In-memory job store for tests and single-process development.
///
/// Each primitive runs inside one critical section, which gives the same
/// atomicity the Redis store gets from its scripts.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<QueueState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory queue lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn push_ready(&self, job: &Job) -> Result<(), JobStoreError> {
        self.state()?.ready.push_back(job.clone());
        Ok(())
    }

    async fn pop_ready(&self) -> Result<Option<Job>, JobStoreError> {
        Ok(self.state()?.ready.pop_front())
    }

    async fn schedule_delayed(
        &self,
        job: &Job,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut state = self.state()?;
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .delayed
            .insert((eligible_at.timestamp_millis(), seq), job.clone());
        Ok(())
    }

    async fn promote_due(
        &self,
        now: DateTime<Utc>,
        max_batch: usize,
    ) -> Result<usize, JobStoreError> {
        let mut state = self.state()?;
        let now_ms = now.timestamp_millis();

        let due: Vec<(i64, u64)> = state
            .delayed
            .keys()
            .take_while(|(score, _)| *score <= now_ms)
            .take(max_batch)
            .copied()
            .collect();

        for key in &due {
            if let Some(job) = state.delayed.remove(key) {
                state.ready.push_back(job);
            }
        }

        Ok(due.len())
    }

    async fn archive_dead(&self, job: Job, reason: Option<String>) -> Result<(), JobStoreError> {
        self.state()?
            .dead
            .push_front(DeadLetterRecord::new(job, reason));
        Ok(())
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, JobStoreError> {
        Ok(self.state()?.dead.iter().take(limit).cloned().collect())
    }

    async fn requeue_dead(&self, job_id: JobId) -> Result<RequeueOutcome, JobStoreError> {
        let mut state = self.state()?;

        let Some(pos) = state.dead.iter().position(|r| r.job.id == job_id) else {
            return Ok(RequeueOutcome::not_found());
        };

        if let Some(record) = state.dead.remove(pos) {
            state.ready.push_back(record.job);
        }

        Ok(RequeueOutcome::requeued())
    }

    async fn ready_len(&self) -> Result<u64, JobStoreError> {
        Ok(self.state()?.ready.len() as u64)
    }

    async fn delayed_len(&self) -> Result<u64, JobStoreError> {
        Ok(self.state()?.delayed.len() as u64)
    }

    async fn dead_len(&self) -> Result<u64, JobStoreError> {
        Ok(self.state()?.dead.len() as u64)
    }

    async fn metrics(&self) -> Result<QueueMetrics, JobStoreError> {
        let state = self.state()?;
        Ok(QueueMetrics {
            ready_length: state.ready.len() as u64,
            delayed_length: state.delayed.len() as u64,
            dead_length: state.dead.len() as u64,
        })
    }
}

#[async_trait::async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn push_ready(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).push_ready(job).await
    }

    async fn pop_ready(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).pop_ready().await
    }

    async fn schedule_delayed(
        &self,
        job: &Job,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).schedule_delayed(job, eligible_at).await
    }

    async fn promote_due(
        &self,
        now: DateTime<Utc>,
        max_batch: usize,
    ) -> Result<usize, JobStoreError> {
        (**self).promote_due(now, max_batch).await
    }

    async fn archive_dead(&self, job: Job, reason: Option<String>) -> Result<(), JobStoreError> {
        (**self).archive_dead(job, reason).await
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, JobStoreError> {
        (**self).list_dead(limit).await
    }

    async fn requeue_dead(&self, job_id: JobId) -> Result<RequeueOutcome, JobStoreError> {
        (**self).requeue_dead(job_id).await
    }

    async fn ready_len(&self) -> Result<u64, JobStoreError> {
        (**self).ready_len().await
    }

    async fn delayed_len(&self) -> Result<u64, JobStoreError> {
        (**self).delayed_len().await
    }

    async fn dead_len(&self) -> Result<u64, JobStoreError> {
        (**self).dead_len().await
    }

    async fn metrics(&self) -> Result<QueueMetrics, JobStoreError> {
        (**self).metrics().await
    }
}


#[cfg(test)]
mod tests {
    use super::contract;
    use super::*;

    #[tokio::test]
    async fn ready_queue_is_fifo() {
        contract::ready_queue_is_fifo(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn delay_is_respected() {
        contract::delay_is_respected(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn promotion_is_bounded_and_score_ordered() {
        contract::promotion_is_bounded_and_score_ordered(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn dead_letters_are_newest_first_and_bounded() {
        contract::dead_letters_are_newest_first_and_bounded(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn requeue_moves_by_id_and_keeps_attempts() {
        contract::requeue_moves_by_id_and_keeps_attempts(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn metrics_reflect_every_store() {
        contract::metrics_reflect_every_store(&InMemoryJobStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pops_never_share_a_job() {
        contract::concurrent_pops_never_share_a_job(InMemoryJobStore::arc()).await;
    }

    #[tokio::test]
    async fn equal_scores_promote_in_insertion_order() {
        let store = InMemoryJobStore::new();
        let at = Utc::now();
        let a = contract::job("a");
        let b = contract::job("b");
        store.schedule_delayed(&a, at).await.unwrap();
        store.schedule_delayed(&b, at).await.unwrap();

        assert_eq!(store.promote_due(at, 10).await.unwrap(), 2);
        assert_eq!(store.pop_ready().await.unwrap().unwrap().id, a.id);
        assert_eq!(store.pop_ready().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn arc_dyn_store_forwards() {
        let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
        store.push_ready(&contract::job("x")).await.unwrap();
        assert_eq!(store.ready_len().await.unwrap(), 1);
        assert_eq!(store.metrics().await.unwrap().ready_length, 1);
    }
}
