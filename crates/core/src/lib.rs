//! `courier-core`: identifiers and domain errors shared by the notification queue.
//!
//! This crate is free of infrastructure concerns (no storage, no runtime).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
