//! Dispatcher: pops ready jobs, delivers them, and applies the retry policy.
//!
//! Each popped job ends in exactly one of three places: delivered (gone),
//! back in the delayed set with `attempts + 1`, or in the dead-letter store.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use courier_core::JobId;

use super::notifier::{DeliveryError, Notifier};
use super::store::{JobStore, JobStoreError};
use super::types::{Job, RetryPolicy};
use crate::workers::{self, WorkerHandle};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long an idle worker sleeps before polling again
    pub poll_interval: Duration,
    /// Upper bound on a single delivery attempt
    pub delivery_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            delivery_timeout: Duration::from_secs(10),
            name: "notification-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }
}

/// What happened to one popped job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered {
        job_id: JobId,
        attempts: u32,
    },
    Retried {
        job_id: JobId,
        attempts: u32,
        eligible_at: DateTime<Utc>,
        error: String,
    },
    DeadLettered {
        job_id: JobId,
        attempts: u32,
        reason: String,
    },
}

impl DispatchOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Delivered { job_id, .. }
            | Self::Retried { job_id, .. }
            | Self::DeadLettered { job_id, .. } => *job_id,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. }
            | Self::Retried { attempts, .. }
            | Self::DeadLettered { attempts, .. } => *attempts,
        }
    }
}

/// Dispatcher runtime statistics, shared by all of its workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub processed: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub store_errors: u64,
    pub workers: usize,
    pub uptime_secs: u64,
}

/// Cloneable read access to a dispatcher's statistics.
#[derive(Debug, Clone)]
pub struct DispatcherStatsHandle {
    inner: Arc<Mutex<DispatcherStats>>,
    started: Instant,
}

impl DispatcherStatsHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DispatcherStats::default())),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherStats> {
        // Counters stay meaningful even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> DispatcherStats {
        let mut stats = self.lock().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Handle to a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    workers: WorkerHandle,
    stats: DispatcherStatsHandle,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStats {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> DispatcherStatsHandle {
        self.stats.clone()
    }

    /// Stop polling and wait for in-flight deliveries to settle.
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
    }
}

/// Background notification dispatcher.
///
/// Cheap to clone; clones share the store, notifier and statistics.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    config: DispatcherConfig,
    stats: DispatcherStatsHandle,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
            config,
            stats: DispatcherStatsHandle::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.snapshot()
    }

    /// Pop and process at most one ready job.
    ///
    /// Returns `Ok(None)` when the ready queue is empty. A store error while
    /// persisting the follow-up state is returned after the job has been logged
    /// in full, since at that point it exists nowhere else.
    pub async fn dispatch_once(&self) -> Result<Option<DispatchOutcome>, JobStoreError> {
        let popped = self.store.pop_ready().await;
        let mut job = match popped {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.stats.lock().store_errors += 1;
                return Err(e);
            }
        };

        debug!(
            dispatcher = %self.config.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "dispatching job"
        );

        let delivery = self.deliver(&job).await;
        job.attempts = job.attempts.saturating_add(1);

        let (outcome, persisted) = match delivery {
            Ok(()) => {
                let outcome = DispatchOutcome::Delivered {
                    job_id: job.id,
                    attempts: job.attempts,
                };
                (outcome, Ok(()))
            }
            Err(err) if self.policy.should_retry(job.attempts) => {
                let delay = self.policy.delay_for_attempt(job.attempts);
                let eligible_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
                let persisted = self.store.schedule_delayed(&job, eligible_at).await;
                let outcome = DispatchOutcome::Retried {
                    job_id: job.id,
                    attempts: job.attempts,
                    eligible_at,
                    error: err.to_string(),
                };
                (outcome, persisted)
            }
            Err(err) => {
                let reason = err.to_string();
                let persisted = self.store.archive_dead(job.clone(), Some(reason.clone())).await;
                let outcome = DispatchOutcome::DeadLettered {
                    job_id: job.id,
                    attempts: job.attempts,
                    reason,
                };
                (outcome, persisted)
            }
        };

        if let Err(e) = persisted {
            self.stats.lock().store_errors += 1;
            error!(
                dispatcher = %self.config.name,
                job = %serde_json::to_string(&job).unwrap_or_else(|_| format!("{job:?}")),
                outcome = ?outcome,
                error = %e,
                "failed to persist job after delivery attempt; job is only in this log"
            );
            return Err(e);
        }

        self.record(&outcome);
        Ok(Some(outcome))
    }

    fn record(&self, outcome: &DispatchOutcome) {
        {
            let mut s = self.stats.lock();
            s.processed += 1;
            match outcome {
                DispatchOutcome::Delivered { .. } => s.delivered += 1,
                DispatchOutcome::Retried { .. } => s.retried += 1,
                DispatchOutcome::DeadLettered { .. } => s.dead_lettered += 1,
            }
        }

        match outcome {
            DispatchOutcome::Delivered { job_id, attempts } => {
                info!(dispatcher = %self.config.name, job_id = %job_id, attempts, "notification delivered");
            }
            DispatchOutcome::Retried {
                job_id,
                attempts,
                eligible_at,
                error,
            } => {
                warn!(
                    dispatcher = %self.config.name,
                    job_id = %job_id,
                    attempts,
                    eligible_at = %eligible_at,
                    error = %error,
                    "delivery failed; retry scheduled"
                );
            }
            DispatchOutcome::DeadLettered {
                job_id,
                attempts,
                reason,
            } => {
                warn!(
                    dispatcher = %self.config.name,
                    job_id = %job_id,
                    attempts,
                    reason = %reason,
                    "delivery failed permanently; job dead-lettered"
                );
            }
        }
    }

    /// One delivery attempt, isolated in its own task so a panic or a hang
    /// in the notifier surfaces as a failed attempt.
    async fn deliver(&self, job: &Job) -> Result<(), DeliveryError> {
        let notifier = self.notifier.clone();
        let job_type = job.job_type.clone();
        let payload = job.payload.clone();

        let task = tokio::spawn(async move { notifier.send(&job_type, &payload).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.config.delivery_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(DeliveryError::Panicked(panic_message(join_err))),
            Err(_) => {
                abort.abort();
                Err(DeliveryError::TimedOut(
                    self.config.delivery_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Spawn `workers` polling tasks sharing this dispatcher.
    pub fn spawn(self, count: usize) -> DispatcherHandle {
        let count = count.max(1);
        let (shutdown_tx, shutdown_rx) = workers::shutdown_channel();
        let mut handle = WorkerHandle::new(self.config.name.clone(), shutdown_tx);
        self.stats.lock().workers = count;

        for worker in 0..count {
            let dispatcher = self.clone();
            let shutdown_rx = shutdown_rx.clone();
            handle.push(tokio::spawn(dispatcher_loop(dispatcher, worker, shutdown_rx)));
        }

        DispatcherHandle {
            workers: handle,
            stats: self.stats.clone(),
        }
    }
}

async fn dispatcher_loop(
    dispatcher: Dispatcher,
    worker: usize,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let name = &dispatcher.config.name;
    info!(dispatcher = %name, worker, "dispatcher worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let idle = match dispatcher.dispatch_once().await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(dispatcher = %name, worker, error = %e, "dispatch failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = workers::stopped(&mut shutdown_rx) => break,
                _ = tokio::time::sleep(dispatcher.config.poll_interval) => {}
            }
        }
    }

    info!(dispatcher = %name, worker, "dispatcher worker stopped");
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "delivery task cancelled".to_string();
    }
    let panic = err.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
