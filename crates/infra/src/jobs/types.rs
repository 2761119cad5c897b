//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{DomainError, DomainResult, JobId};

/// Opaque delivery payload (recipient contact, message fields, ...).
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Longest accepted job type tag.
const MAX_JOB_TYPE_LEN: usize = 200;

/// Tag identifying the notification kind, used to route delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    pub const BOOKING_CONFIRMATION: &'static str = "booking_confirmation";
    pub const PAYMENT_CONFIRMATION: &'static str = "payment_confirmation";
    pub const PAYMENT_FAILED: &'static str = "payment_failed";

    /// Validate and wrap a job type tag.
    pub fn new(tag: impl Into<String>) -> DomainResult<Self> {
        let tag = tag.into();
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("job type must not be empty"));
        }
        if trimmed.len() > MAX_JOB_TYPE_LEN {
            return Err(DomainError::validation(format!(
                "job type must be at most {MAX_JOB_TYPE_LEN} bytes"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn booking_confirmation() -> Self {
        Self(Self::BOOKING_CONFIRMATION.to_string())
    }

    pub fn payment_confirmation() -> Self {
        Self(Self::PAYMENT_CONFIRMATION.to_string())
    }

    pub fn payment_failed() -> Self {
        Self(Self::PAYMENT_FAILED.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A notification job.
///
/// Serialized as `{id, type, payload, attempts, createdAt}`; that JSON is
/// also the stored representation in the Redis backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub payload: Payload,
    /// Dispatch attempts already made. Only the dispatcher increments this.
    #[serde(default)]
    pub attempts: u32,
    /// Auditing only; scheduling never looks at it.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a fresh job with zero attempts.
    pub fn new(job_type: JobType, payload: Payload) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            payload,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Retry policy applied by the dispatcher after a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total dispatch attempts allowed before dead-lettering.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the next dispatch, given the attempts made so far (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                // 2^31 already dwarfs any sane cap; clamp the shift to avoid overflow.
                let factor = 1u32 << (attempt - 1).min(31);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Entry in the dead-letter store.
///
/// Immutable once written; removed only by an operator requeue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub job: Job,
    pub reason: Option<String>,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(job: Job, reason: Option<String>) -> Self {
        Self {
            job,
            reason,
            moved_at: Utc::now(),
        }
    }
}

/// Result of an operator requeue: `{ok}` or `{ok: false, reason}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RequeueOutcome {
    pub fn requeued() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            ok: false,
            reason: Some("Not found".to_string()),
        }
    }
}

/// Lengths of the three stores, for operational tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub ready_length: u64,
    pub delayed_length: u64,
    pub dead_length: u64,
}
