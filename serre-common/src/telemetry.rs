use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// A single reading published by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPoint {
    /// Unix epoch milliseconds when the reading was cached.
    pub timestamp: i64,

    /// Device name from configuration (e.g., "poseidon", "tcw241").
    pub source: String,

    /// Kind of field device that produced the reading.
    pub device: DeviceKind,

    /// Metric name (e.g., "temperature", "humidity/h1", "relay/3").
    pub metric: String,

    /// The measured value.
    pub value: TelemetryValue,

    /// Additional context labels (e.g., unit, register address).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl TelemetryPoint {
    /// Create a new telemetry point with the current timestamp.
    pub fn new(
        source: impl Into<String>,
        device: DeviceKind,
        metric: impl Into<String>,
        value: TelemetryValue,
    ) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            source: source.into(),
            device,
            metric: metric.into(),
            value,
            labels: HashMap::new(),
        }
    }

    /// Override the timestamp (e.g., with the cache update time).
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a label to this telemetry point.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Typed telemetry value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TelemetryValue {
    /// Counter (monotonically increasing), e.g. flow meter pulses.
    Counter(u64),

    /// Gauge (can go up or down), e.g. temperature or humidity.
    Gauge(f64),

    /// Boolean value, e.g. tank level switch or relay state.
    Boolean(bool),
}

impl From<u64> for TelemetryValue {
    fn from(v: u64) -> Self {
        TelemetryValue::Counter(v)
    }
}

impl From<u32> for TelemetryValue {
    fn from(v: u32) -> Self {
        TelemetryValue::Counter(u64::from(v))
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        TelemetryValue::Gauge(v)
    }
}

impl From<bool> for TelemetryValue {
    fn from(v: bool) -> Self {
        TelemetryValue::Boolean(v)
    }
}

/// Field device families handled by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Water-management unit (tank, flow meter, pump, rain valve).
    Poseidon,
    /// Environmental unit (temperature, humidity, relays).
    Tcw241,
}

impl DeviceKind {
    /// Get the string representation used in payloads and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Poseidon => "poseidon",
            DeviceKind::Tcw241 => "tcw241",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_point_creation() {
        let point = TelemetryPoint::new(
            "serre-nord",
            DeviceKind::Tcw241,
            "humidity/mean",
            TelemetryValue::Gauge(54.5),
        )
        .with_label("unit", "%")
        .at(1_700_000_000_000);

        assert_eq!(point.source, "serre-nord");
        assert_eq!(point.device, DeviceKind::Tcw241);
        assert_eq!(point.value, TelemetryValue::Gauge(54.5));
        assert_eq!(point.timestamp, 1_700_000_000_000);
        assert_eq!(point.labels.get("unit"), Some(&"%".to_string()));
    }

    #[test]
    fn test_untagged_value_serialization() {
        let json = serde_json::to_string(&TelemetryValue::Boolean(true)).unwrap();
        assert_eq!(json, "true");

        let json = serde_json::to_string(&TelemetryValue::Counter(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(TelemetryValue::from(42u32), TelemetryValue::Counter(42));
        assert_eq!(TelemetryValue::from(21.5), TelemetryValue::Gauge(21.5));
        assert_eq!(TelemetryValue::from(false), TelemetryValue::Boolean(false));
        assert_eq!(DeviceKind::Poseidon.to_string(), "poseidon");
    }
}
