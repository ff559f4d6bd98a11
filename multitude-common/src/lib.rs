//! Multitude Common Library
//!
//! Shared plumbing for the multitude scrape proxy:
//!
//! - [`config`] - Configuration loading (JSON5 format) and logging settings
//! - [`credentials`] - Credential source used to build per-target connection strings
//! - [`error`] - Error types

pub mod config;
pub mod credentials;
pub mod error;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, load_config, parse_config};
pub use credentials::Credentials;
pub use error::{Error, Result};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over `config.level` when it is set. An invalid
/// `config.level` is a configuration error.
///
/// # Example
///
/// ```ignore
/// use multitude_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.level)?,
    };

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}

/// Parse a log level or filter directive such as `"info"` or `"multitude=debug,info"`.
pub fn parse_filter(level: &str) -> Result<tracing_subscriber::EnvFilter> {
    tracing_subscriber::EnvFilter::try_new(level)
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", level, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter_accepts_levels_and_directives() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("multitude=debug,tower_http=warn").is_ok());
    }

    #[test]
    fn test_parse_filter_rejects_invalid_level() {
        let err = parse_filter("multitude=loud").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("multitude=loud"));
    }
}
