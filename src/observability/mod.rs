pub mod usage;

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
///
/// A `RUST_LOG` directive, when set, takes precedence over the level.
/// Logs go to stderr so replay output on stdout stays machine-readable.
pub fn init_tracing(logging: &LoggingConfig) {
    let Some(tracing_level) = tracing_level(&logging.log_level) else {
        return;
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(tracing_level))
        .unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    // try_init: tests and embedding applications may already own the global subscriber.
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Map a config log level to a tracing filter level; `None` means disabled.
#[must_use]
pub fn tracing_level(log_level: &str) -> Option<&'static str> {
    match log_level.to_uppercase().as_str() {
        "DISABLED" => None,
        "DEBUG" => Some("DEBUG"),
        "WARNING" | "WARN" => Some("WARN"),
        "ERROR" | "CRITICAL" => Some("ERROR"),
        _ => Some("INFO"),
    }
}
