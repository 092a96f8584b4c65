//! Process-wide tracing setup shared by every cadence binary.

/// Initialize process-wide tracing with the format named by `CADENCE_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;
