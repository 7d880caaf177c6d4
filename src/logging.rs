#![forbid(unsafe_code)]

use tracing_subscriber::{EnvFilter, fmt};

/// Installs the fmt subscriber for a binary. `RUST_LOG` wins over `default`.
pub fn init(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
