//! Tracing setup: console on stderr plus an optional daily JSON file.

use klaviyo_relay_config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const CRATES: &[&str] = &[
    "klaviyo_relay",
    "klaviyo_relay_auth",
    "klaviyo_relay_server",
    "klaviyo_relay_client",
    "klaviyo_relay_config",
];

fn directives(level: &str, fallback: &str) -> String {
    let mut parts: Vec<String> = CRATES.iter().map(|c| format!("{}={}", c, level)).collect();
    parts.push(fallback.to_string());
    parts.join(",")
}

/// Console filter: `RUST_LOG`, then the config, then the verbosity default.
fn console_filter(verbose: bool, config: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    if !verbose && let Some(filter) = config.filter.as_deref() {
        return EnvFilter::new(filter);
    }
    if verbose {
        EnvFilter::new(directives("debug", "info"))
    } else {
        EnvFilter::new(directives("info", "warn"))
    }
}

/// Install the global subscriber. Keep the guard alive until exit so the
/// file writer flushes.
pub fn init(verbose: bool, config: &LoggingConfig) -> Option<WorkerGuard> {
    let mut guard = None;

    let file_layer = if config.json_file {
        let dir = config.effective_directory();
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(&dir, "klaviyo-relay.log");
                let (writer, g) = tracing_appender::non_blocking(appender);
                guard = Some(g);
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_filter(EnvFilter::new(directives("trace", "info"))),
                )
            }
            Err(e) => {
                eprintln!("warning: cannot create log directory {}: {}", dir.display(), e);
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(console_filter(verbose, config)),
        )
        .with(file_layer)
        .init();

    guard
}
