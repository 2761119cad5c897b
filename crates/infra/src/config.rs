//! Configuration loading and representation.
//!
//! Everything is read from the environment once at startup. `from_lookup`
//! takes any key → value function so tests never touch process state.

use std::time::Duration;

use crate::jobs::dispatcher::DispatcherConfig;
use crate::jobs::sweeper::SweeperConfig;
use crate::jobs::types::RetryPolicy;
use crate::jobs::DEFAULT_KEY_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: expected {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

/// Queue, retry, worker and delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub redis_url: Option<String>,
    /// Fail startup when `redis_url` is unset instead of using the in-memory store
    pub require_redis: bool,
    pub key_prefix: String,
    pub retry: RetryPolicy,
    pub delivery_timeout: Duration,
    pub workers: usize,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch: usize,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        let sweeper = SweeperConfig::default();
        Self {
            redis_url: None,
            require_redis: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retry: RetryPolicy::default(),
            delivery_timeout: dispatcher.delivery_timeout,
            workers: 2,
            poll_interval: dispatcher.poll_interval,
            sweep_interval: sweeper.interval,
            sweep_batch: sweeper.batch_size,
            webhook_url: None,
            webhook_token: None,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_attempts: env.parse(
                "NOTIFY_MAX_ATTEMPTS",
                "a positive integer",
                defaults.retry.max_attempts,
            )?,
            base_delay: env.millis("NOTIFY_BACKOFF_BASE_MS", defaults.retry.base_delay)?,
            max_delay: env.millis("NOTIFY_BACKOFF_MAX_MS", defaults.retry.max_delay)?,
            strategy: env.parse(
                "NOTIFY_BACKOFF_STRATEGY",
                "fixed or exponential",
                defaults.retry.strategy,
            )?,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "NOTIFY_MAX_ATTEMPTS",
                expected: "a positive integer",
                value: "0".to_string(),
            });
        }
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::Inconsistent(
                "NOTIFY_BACKOFF_MAX_MS must not be below NOTIFY_BACKOFF_BASE_MS".to_string(),
            ));
        }

        Ok(Self {
            redis_url: env.string("REDIS_URL"),
            require_redis: env.flag("COURIER_REQUIRE_REDIS", defaults.require_redis)?,
            key_prefix: env.string("COURIER_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            retry,
            delivery_timeout: env
                .positive_millis("NOTIFY_DELIVERY_TIMEOUT_MS", defaults.delivery_timeout)?,
            workers: env.parse("NOTIFY_WORKERS", "a positive integer", defaults.workers)?.max(1),
            poll_interval: env.positive_millis("NOTIFY_POLL_INTERVAL_MS", defaults.poll_interval)?,
            sweep_interval: env
                .positive_millis("NOTIFY_SWEEP_INTERVAL_MS", defaults.sweep_interval)?,
            sweep_batch: env.positive("NOTIFY_SWEEP_BATCH", defaults.sweep_batch)?,
            webhook_url: env.string("NOTIFY_WEBHOOK_URL"),
            webhook_token: env.string("NOTIFY_WEBHOOK_TOKEN"),
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_delivery_timeout(self.delivery_timeout)
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig::default()
            .with_interval(self.sweep_interval)
            .with_batch_size(self.sweep_batch)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(
        &self,
        key: &'static str,
        expected: &'static str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key,
                expected,
                value,
            }),
        }
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, "milliseconds", default_ms)
            .map(Duration::from_millis)
    }

    /// Like `parse`, but zero is rejected.
    fn positive(&self, key: &'static str, default: usize) -> Result<usize, ConfigError> {
        match self.parse(key, "a positive integer", default)? {
            0 => Err(ConfigError::Invalid {
                key,
                expected: "a positive integer",
                value: "0".to_string(),
            }),
            n => Ok(n),
        }
    }

    fn positive_millis(
        &self,
        key: &'static str,
        default: Duration,
    ) -> Result<Duration, ConfigError> {
        let millis = self.millis(key, default)?;
        if millis.is_zero() {
            return Err(ConfigError::Invalid {
                key,
                expected: "a positive integer",
                value: "0".to_string(),
            });
        }
        Ok(millis)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(value) => Err(ConfigError::Invalid {
                key,
                expected: "a boolean",
                value,
            }),
        }
    }
}
