//! Structured logging initialization.
//!
//! Configures the tracing subscriber from the framework config. The RUST_LOG
//! environment variable takes precedence over the configured level. The
//! asynchronous file writer and rotation policy live outside the framework;
//! the config carries their keys through untouched.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// Initialize the logging subsystem. Safe to call more than once; later
/// calls are no-ops (first subscriber wins).
pub fn init(config: &Config) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.log_level.as_filter())
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init();
}
