//! Tracing subscriber setup.

use crate::config::ApplicationConfig;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber, writing to stderr so that stdout stays
/// free for protocol replies. Returns false if a subscriber was already set.
pub fn init(config: &ApplicationConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.log_level))
        .with_writer(std::io::stderr)
        .with_target(true);
    if config.json_logs {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}
