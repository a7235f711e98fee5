//! Shared tracing/logging initialisation.
//!
//! The daemon binary and the integration test harnesses set up
//! `tracing_subscriber` the same way: an env-filter with an optional JSON
//! formatter for log aggregation.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"kbroker_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Returns `false` when a global subscriber was already installed, which
/// happens when tests initialise logging more than once.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    result.is_ok()
}

/// Build the default filter directive for a crate at a given level.
///
/// `daemon_filter("kbroker_daemon", "debug")` yields
/// `"kbroker_daemon=debug,kbroker_core=debug"` so both crates log at the
/// requested level while third-party crates stay at their defaults.
pub fn daemon_filter(crate_name: &str, level: &str) -> String {
    format!("{crate_name}={level},kbroker_core={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_covers_core_crate() {
        assert_eq!(
            daemon_filter("kbroker_daemon", "warn"),
            "kbroker_daemon=warn,kbroker_core=warn"
        );
    }

    #[test]
    fn second_init_reports_existing_subscriber() {
        let _ = init_tracing("warn", false);
        assert!(!init_tracing("warn", true));
    }
}
