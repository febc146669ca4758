//! Tracing subscriber setup for the host process.
//!
//! Host diagnostics go to stderr. The worker's own stdout is relayed to the
//! host's stdout verbatim, so keeping the two apart lets operators pipe
//! function output separately from host logs.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for a log level, covering the host
/// crates and the HTTP middleware.
pub fn default_filter(level: &str) -> String {
    format!("yafaas={level},yafaas_server={level},tower_http={level}")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter` when set. With
/// `log_json`, events are emitted as one JSON object per line.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_covers_host_crates() {
        let filter = default_filter("debug");
        assert!(filter.contains("yafaas_server=debug"));
        assert!(filter.contains("tower_http=debug"));
    }
}
