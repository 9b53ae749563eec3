//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "TASKWATCH_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Human-readable, multi-line
    Pretty,
}

impl LogFormat {
    /// Anything other than `pretty` (case-insensitive) means JSON.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("pretty") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Initialize tracing/logging for the process, filtered by `RUST_LOG`
/// (default `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = match format {
        LogFormat::Json => builder.json().with_target(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pretty_selects_pretty() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(" PRETTY "), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Json);
    }

    #[test]
    fn init_twice_is_harmless() {
        init(LogFormat::Json);
        init(LogFormat::Pretty);
    }
}
