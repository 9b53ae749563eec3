//! Tracing and logging setup shared by the binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide tracing.
///
/// Output format comes from `TASKWATCH_LOG_FORMAT` (`json` by default,
/// `pretty` for local development). Safe to call multiple times; later
/// calls are no-ops.
pub fn init() {
    let format = std::env::var(tracing::ENV_LOG_FORMAT)
        .ok()
        .map(|raw| LogFormat::parse(&raw))
        .unwrap_or_default();
    tracing::init(format);
}
