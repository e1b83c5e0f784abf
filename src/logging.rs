//! Process-wide log subscriber.
//!
//! Installed once at startup and never changed afterwards. Components do
//! not reach for global state: each gets its own [`tracing::Span`] through
//! its constructor and logs inside it.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the fmt subscriber. `RUST_LOG`, when set, takes precedence
/// over `level`.
///
/// Returns an error if a global subscriber is already installed.
pub fn init(level: &str) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter(level))
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    // Never call `init` here: the subscriber is process-wide.
    #[test]
    fn test_configured_level_applies_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(filter("warn").max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_per_target_directives_are_accepted() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = filter("info,outbox_relay::publisher=trace");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }
}
