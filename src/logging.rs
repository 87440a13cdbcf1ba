//! Structured logging setup.
use tracing_subscriber::{EnvFilter, fmt};

/// Installs a fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Returns false when a global subscriber was already set.
pub fn init_tracing(default_filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
