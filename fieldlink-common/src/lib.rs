//! Fieldlink Common Library
//!
//! This crate provides shared types and utilities for the fieldlink gateway:
//!
//! - [`telemetry`] - Outbound data model (`TelemetryEvent`, `StateMessage`, `OutboundMessage`)
//! - [`serialization`] - JSON/CBOR encoding plus gzip/lzma compression
//! - [`config`] - Logging settings
//! - [`topics`] - Cloud topic and client identity builders
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod serialization;
pub mod telemetry;
pub mod topics;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use serialization::{
    Compression, Format, compress, decode, decompress, encode, encode_compressed,
};
pub use telemetry::{
    OutboundMessage, Qos, ReadingResult, StateMessage, TelemetryEvent, TopicClass,
    current_timestamp_secs,
};
pub use topics::{DeviceIdentity, TopicBuilder};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_thread_names(true))
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

    tracing::debug!(level = %config.level, format = ?config.format, "Tracing initialized");
    Ok(())
}
