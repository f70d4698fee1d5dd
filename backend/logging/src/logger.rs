//! Structured Logger
//!
//! Wraps `tracing` to provide JSON-formatted output, file rotation (NDJSON),
//! and environment-based level control.

use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log file prefix; the appender adds a `.YYYY-MM-DD` suffix.
pub const LOG_FILE_NAME: &str = "tubelens.log";

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global structured logger.
/// Creates a console logger and a rolling file logger under `log_dir`.
pub fn init_logger<P: AsRef<Path>>(log_dir: P, level: &str) {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir.as_ref(), LOG_FILE_NAME);

    let file_layer = fmt::layer()
        .json()
        .with_writer(file_appender)
        .with_ansi(false);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(true);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

/// Console-only variant for runs with file logging disabled.
pub fn init_console_logger(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
