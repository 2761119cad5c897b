//! HTTP API: operator endpoints for the notification queue.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
