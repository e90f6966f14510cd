//! Serre Common Library
//!
//! This crate provides shared types and utilities for the greenhouse supervisor:
//!
//! - [`telemetry`] - Telemetry data model (`TelemetryPoint`, `TelemetryValue`, `DeviceKind`)
//! - [`serialization`] - JSON/CBOR encoding and decoding
//! - [`config`] - Zenoh and logging configuration sections
//! - [`keyexpr`] - Key expression builders
//! - [`publisher`] - Zenoh session opening and publishing of telemetry and JSON documents
//! - [`status`] - Supervisor status reporting
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod keyexpr;
pub mod publisher;
pub mod serialization;
pub mod status;
pub mod telemetry;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, ZenohConfig};
pub use error::{Error, Result};
pub use keyexpr::{KEY_PREFIX, KeyExprBuilder};
pub use publisher::{Publisher, connect, zenoh_config};
pub use serialization::{Format, decode, decode_auto, encode};
pub use status::SupervisorStatus;
pub use telemetry::{DeviceKind, TelemetryPoint, TelemetryValue, current_timestamp_millis};

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
