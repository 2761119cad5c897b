//! Infrastructure layer: job stores, Redis, workers, delivery and configuration.

pub mod config;
pub mod jobs;
pub mod workers;

pub use config::{ConfigError, QueueConfig};
