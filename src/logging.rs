use crate::config::DEFAULT_LOG_FILTER;
use tracing_subscriber::EnvFilter;

/// Filter from an already-resolved directive string
///
/// `Config` has read `SPEND_GRAPH_LOG` by the time this runs. A malformed
/// directive falls back to the default level.
fn build_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global fmt subscriber
///
/// Logs go to stderr so command output on stdout stays clean.
pub fn init_tracing(directives: &str) {
    // A second init (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(directives))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
