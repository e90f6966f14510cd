//! Supervisor status reporting.

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::publisher::Publisher;

/// Supervisor status information, published on `<prefix>/@/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    /// Supervisor name.
    pub supervisor: String,
    /// Supervisor version.
    pub version: String,
    /// Current status ("running", "offline").
    pub status: String,
    /// Names of the supervised devices.
    #[serde(default)]
    pub devices: Vec<String>,
}

impl SupervisorStatus {
    /// Create a new status with "running" state.
    pub fn running(supervisor: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            supervisor: supervisor.into(),
            version: version.into(),
            status: "running".to_string(),
            devices: Vec::new(),
        }
    }

    /// Create a status with "offline" state.
    pub fn offline(supervisor: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            supervisor: supervisor.into(),
            version: version.into(),
            status: "offline".to_string(),
            devices: Vec::new(),
        }
    }

    /// Attach the list of supervised devices.
    pub fn with_devices(mut self, devices: Vec<String>) -> Self {
        self.devices = devices;
        self
    }

    /// Publish this status to Zenoh.
    pub async fn publish(&self, publisher: &Publisher) -> Result<()> {
        let key = publisher.keys().status();
        publisher.publish_json(&key, self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let status = SupervisorStatus::running("serre-supervisor", "0.2.0")
            .with_devices(vec!["poseidon".to_string(), "tcw241".to_string()]);

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"devices\":[\"poseidon\",\"tcw241\"]"));
    }

    #[test]
    fn test_status_offline() {
        let status = SupervisorStatus::offline("serre-supervisor", "0.2.0");
        assert_eq!(status.status, "offline");
        assert!(status.devices.is_empty());
    }
}
