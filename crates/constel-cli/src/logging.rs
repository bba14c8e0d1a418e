use std::io;

use tracing::Span;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "constel=info,warn";

/// How records are rendered on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact lines for the one-shot tools.
    Human,
    /// One JSON object per record, carrying the daemon span, for journald.
    Json,
}

impl LogFormat {
    /// Daemons log JSON, everything else logs compact text.
    pub fn for_daemon(daemon: bool) -> Self {
        if daemon { Self::Json } else { Self::Human }
    }
}

/// Parse `directives`, falling back to [`DEFAULT_FILTER`] when they are
/// missing or invalid.
pub fn build_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Span wrapping a daemon's whole run so every JSON record names it.
pub fn daemon_span(component: &'static str) -> Span {
    tracing::info_span!("daemon", component)
}

/// Install the global subscriber. Output goes to stderr so command output
/// on stdout stays machine-readable.
pub fn init(format: LogFormat) {
    let filter = build_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());
    let registry = tracing_subscriber::registry().with(filter);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = match format {
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_falls_back() {
        for raw in [None, Some(""), Some("   "), Some("constel=[")] {
            assert_eq!(
                build_filter(raw).to_string(),
                EnvFilter::new(DEFAULT_FILTER).to_string(),
                "{:?}",
                raw
            );
        }
    }

    #[test]
    fn test_build_filter_keeps_valid_directives() {
        assert_eq!(build_filter(Some("constel_coordinator=debug")).to_string(), "constel_coordinator=debug");
    }

    #[test]
    fn test_daemons_log_json() {
        assert_eq!(LogFormat::for_daemon(true), LogFormat::Json);
        assert_eq!(LogFormat::for_daemon(false), LogFormat::Human);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(LogFormat::Human);
        init(LogFormat::Json);
        let _entered = daemon_span("coordinator").entered();
        tracing::info!("still logging");
    }
}
