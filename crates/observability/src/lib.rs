//! Process-wide tracing setup shared by the binaries.

pub mod tracing;

pub use tracing::LogFormat;

/// Initialize process-wide tracing with the format named by `LOG_FORMAT`.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}
