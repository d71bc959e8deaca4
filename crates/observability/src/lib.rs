//! Tracing and logging setup shared by courier binaries.

/// Initialize process-wide logging with the format picked from
/// `COURIER_LOG_FORMAT` (JSON unless it says `pretty`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(tracing::LogFormat::from_env());
}

/// Initialize process-wide logging with an explicit output format.
pub fn init_with(format: LogFormat) {
    tracing::init_with(format);
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use tracing::LogFormat;
