//! Logging initialization.
//!
//! Builds one fmt subscriber from the `[logging]` config section. A set
//! RUST_LOG environment variable overrides the configured filter level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Initialize the logging subsystem.
pub fn init(config: &LoggingConfig) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(config.level.as_str()),
    };

    // Common options compose once; the output format is part of the
    // builder's type, so each variant finishes on its own arm.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => builder.init(),
        (LogFormat::Pretty, false) => builder.without_time().init(),
        (LogFormat::Json, true) => builder.json().init(),
        (LogFormat::Json, false) => builder.json().without_time().init(),
        (LogFormat::Compact, true) => builder.compact().init(),
        (LogFormat::Compact, false) => builder.compact().without_time().init(),
    }
}
