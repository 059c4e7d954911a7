//! WeatherFlow Common Library
//!
//! Shared types and utilities for the WeatherFlow Tempest exporter:
//!
//! - [`message`] - Typed feed messages (`Message`, `StRecord`, `RapidWindRecord`) and listen commands
//! - [`serialization`] - Text frame decoding and encoding
//! - [`config`] - Logging settings shared by the binaries
//! - [`token`] - Log-safe display of API tokens
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod message;
pub mod serialization;
pub mod token;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use message::{
    Command, DeviceId, Message, PrecipEvent, RapidWind, RapidWindRecord, StObservation,
    StRecord, StrikeEvent,
};
pub use serialization::{decode_message, encode_command};
pub use token::{RedactedToken, redact};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over `config.level` when set.
///
/// # Example
///
/// ```ignore
/// use weatherflow_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

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
