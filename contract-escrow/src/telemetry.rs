//! Tracing subscriber setup for binaries embedding the engine

use crate::{config::LoggingConfig, error::EscrowError, EscrowResult};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured filter directive. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> EscrowResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| EscrowError::config(format!("Invalid log filter: {}", e)))?,
    };

    let builder = fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| EscrowError::config(format!("Failed to install tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_once() {
        let config = LoggingConfig::default();
        assert!(init_tracing(&config).is_ok());
        // a second global subscriber is refused
        assert_eq!(init_tracing(&config).unwrap_err().kind(), "ConfigurationError");
    }
}
