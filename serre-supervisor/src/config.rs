//! Configuration for the greenhouse supervisor.

use serde::{Deserialize, Serialize};
use serre_common::config::{LoggingConfig, ZenohConfig};
use serre_common::serialization::Format;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::connection::Endpoint;
use crate::regulation::Setpoint;
use crate::tcw241::RelayRoles;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Telemetry encoding: "json" or "cbor"
    #[serde(default)]
    pub serialization: Format,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Supervised units
    pub serre: SerreConfig,
}

/// Supervised units and key layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerreConfig {
    /// Key expression prefix (default: "serre")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Water-management unit
    #[serde(default)]
    pub poseidon: Option<PoseidonConfig>,

    /// Environment unit
    #[serde(default)]
    pub tcw241: Option<Tcw241Config>,
}

fn default_key_prefix() -> String {
    serre_common::KEY_PREFIX.to_string()
}

/// Poseidon water-management unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseidonConfig {
    /// Device name (used in key expressions)
    #[serde(default = "default_poseidon_name")]
    pub name: String,

    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Poll interval in milliseconds
    #[serde(default = "default_poseidon_interval_ms")]
    pub poll_interval_ms: u64,

    /// Connect and per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Litres of water per flow-meter pulse
    #[serde(default = "default_litres_per_pulse")]
    pub litres_per_pulse: f64,

    /// Raw temperature register * scale = degrees Celsius
    #[serde(default = "default_temperature_scale")]
    pub temperature_scale: f64,
}

/// TCW241 environment unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tcw241Config {
    /// Device name (used in key expressions)
    #[serde(default = "default_tcw_name")]
    pub name: String,

    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Poll interval in milliseconds
    #[serde(default = "default_tcw_interval_ms")]
    pub poll_interval_ms: u64,

    /// Connect and per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Relay numbers of the misting, heating and window outputs
    #[serde(default)]
    pub relays: RelayRoles,

    /// Initial regulation targets, replaced by setpoints received over Zenoh
    #[serde(default)]
    pub setpoint: Setpoint,
}

fn default_poseidon_name() -> String {
    "poseidon".to_string()
}

fn default_tcw_name() -> String {
    "tcw241".to_string()
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_poseidon_interval_ms() -> u64 {
    2000
}

fn default_tcw_interval_ms() -> u64 {
    5000
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_litres_per_pulse() -> f64 {
    crate::poseidon::DEFAULT_LITRES_PER_PULSE
}

fn default_temperature_scale() -> f64 {
    1.0
}

impl PoseidonConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port, self.unit_id)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Tcw241Config {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.host, self.port, self.unit_id)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SupervisorConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SupervisorConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serre.key_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.serre.poseidon.is_none() && self.serre.tcw241.is_none() {
            return Err(ConfigError::Validation(
                "At least one device must be configured".to_string(),
            ));
        }

        if let Some(poseidon) = &self.serre.poseidon {
            validate_device(
                &poseidon.name,
                &poseidon.host,
                poseidon.unit_id,
                poseidon.poll_interval_ms,
                poseidon.timeout_ms,
            )?;

            if !poseidon.litres_per_pulse.is_finite() || poseidon.litres_per_pulse < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': litres_per_pulse must be a non-negative number",
                    poseidon.name
                )));
            }

            if !poseidon.temperature_scale.is_finite() || poseidon.temperature_scale == 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': temperature_scale must be a non-zero number",
                    poseidon.name
                )));
            }
        }

        if let Some(tcw) = &self.serre.tcw241 {
            validate_device(
                &tcw.name,
                &tcw.host,
                tcw.unit_id,
                tcw.poll_interval_ms,
                tcw.timeout_ms,
            )?;

            if !tcw.relays.are_distinct() {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': misting, heating and window must use different relays",
                    tcw.name
                )));
            }
        }

        if let (Some(poseidon), Some(tcw)) = (&self.serre.poseidon, &self.serre.tcw241) {
            if poseidon.name == tcw.name {
                return Err(ConfigError::Validation(format!(
                    "Device name '{}' is used twice",
                    tcw.name
                )));
            }
        }

        Ok(())
    }

    /// Names of the configured devices.
    pub fn device_names(&self) -> Vec<String> {
        self.serre
            .poseidon
            .iter()
            .map(|d| d.name.clone())
            .chain(self.serre.tcw241.iter().map(|d| d.name.clone()))
            .collect()
    }
}

fn validate_device(
    name: &str,
    host: &str,
    unit_id: u8,
    poll_interval_ms: u64,
    timeout_ms: u64,
) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Validation(
            "Device name cannot be empty".to_string(),
        ));
    }

    if name.contains(['/', '*', '$', '?', '#', '@']) {
        return Err(ConfigError::Validation(format!(
            "Device '{}': name must not contain key expression characters",
            name
        )));
    }

    if host.is_empty() {
        return Err(ConfigError::Validation(format!(
            "Device '{}': host cannot be empty",
            name
        )));
    }

    if !(1..=247).contains(&unit_id) {
        return Err(ConfigError::Validation(format!(
            "Device '{}': unit_id must be 1-247",
            name
        )));
    }

    if poll_interval_ms == 0 || timeout_ms == 0 {
        return Err(ConfigError::Validation(format!(
            "Device '{}': poll_interval_ms and timeout_ms must be greater than 0",
            name
        )));
    }

    Ok(())
}
