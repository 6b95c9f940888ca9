use super::{ConfigError, InterpreterConfig};

pub const VALID_LOG_LEVELS: [&str; 6] =
    ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

/// Validate the full interpreter config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Tag`] for invalid tag names and
/// [`ConfigError::Validation`] when any other configuration invariant is violated.
pub fn validate_config(config: &InterpreterConfig) -> Result<(), ConfigError> {
    config.tags.extraction_tags()?;
    validate_sessions(config)?;
    validate_log_level(config)?;
    validate_runtime(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_sessions(config: &InterpreterConfig) -> Result<(), ConfigError> {
    let sessions = &config.sessions;
    if sessions.shard_count == 0 {
        return Err(validation_err("sessions.shard_count must be greater than 0"));
    }
    if sessions.idle_timeout_secs.is_some() && sessions.reaper_interval_secs == 0 {
        return Err(validation_err(
            "sessions.reaper_interval_secs must be greater than 0 when idle_timeout_secs is set",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &InterpreterConfig) -> Result<(), ConfigError> {
    if !VALID_LOG_LEVELS.contains(&config.logging.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "logging.log_level must be one of {VALID_LOG_LEVELS:?}"
        )));
    }
    Ok(())
}

fn validate_runtime(config: &InterpreterConfig) -> Result<(), ConfigError> {
    if config.runtime.worker_threads == Some(0) {
        return Err(validation_err(
            "runtime.worker_threads must be greater than 0 when set",
        ));
    }
    Ok(())
}
