//! Tracing/logging setup shared by the courier binaries and tests.

/// Initialize process-wide logging using `RUST_LOG` and `COURIER_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, output format).
pub mod tracing;
