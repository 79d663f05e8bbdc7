//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacities > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RuntimeConfig → Result<(), Vec<ValidationError>>
//! - A low worker priority is not an error; it is raised with a warning when
//!   the context starts

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::RuntimeConfig;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Check a configuration, collecting every problem.
pub fn validate_config(config: &RuntimeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.event_queue.capacity == 0 {
        errors.push(ValidationError::new("event_queue.capacity", "must be greater than 0"));
    }

    if config.worker.name.trim().is_empty() {
        errors.push(ValidationError::new("worker.name", "must not be empty"));
    }

    if config.worker.watchdog_ms == 0 {
        errors.push(ValidationError::new("worker.watchdog_ms", "must be greater than 0"));
    }

    if config.tcp.listen_backlog == 0 {
        errors.push(ValidationError::new("tcp.listen_backlog", "must be greater than 0"));
    }

    if config.tcp.max_slots > u16::MAX as usize {
        errors.push(ValidationError::new(
            "tcp.max_slots",
            format!("must not exceed {}", u16::MAX),
        ));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", config.observability.log_level),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&RuntimeConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = RuntimeConfig::default();
        config.event_queue.capacity = 0;
        config.tcp.listen_backlog = 0;
        config.observability.log_level = "loud".into();
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "nowhere".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "event_queue.capacity",
                "tcp.listen_backlog",
                "observability.log_level",
                "observability.metrics_address"
            ]
        );
    }
}
