/// Default key expression prefix for everything the supervisor publishes.
pub const KEY_PREFIX: &str = "serre";

/// Builder for the supervisor's key expressions.
///
/// Key expressions follow the pattern:
/// - `<prefix>/<device>/<metric>` for individual readings
/// - `<prefix>/<device>/state` for the full device snapshot
/// - `<prefix>/<device>/@/<input>` for values pushed to the supervisor
/// - `<prefix>/@/status` for the supervisor itself
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    /// Create a builder with a custom prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a key expression for a single metric of a device.
    ///
    /// # Example
    /// ```
    /// use serre_common::keyexpr::KeyExprBuilder;
    ///
    /// let key = KeyExprBuilder::default().metric("poseidon", "temperature");
    /// assert_eq!(key, "serre/poseidon/temperature");
    /// ```
    pub fn metric(&self, device: &str, metric: &str) -> String {
        format!("{}/{}/{}", self.prefix, device, metric)
    }

    /// Key expression of a device's full snapshot.
    pub fn state(&self, device: &str) -> String {
        format!("{}/{}/state", self.prefix, device)
    }

    /// Key expression on which setpoints for a device are received.
    ///
    /// # Example
    /// ```
    /// use serre_common::keyexpr::KeyExprBuilder;
    ///
    /// let key = KeyExprBuilder::new("site1").setpoint("tcw241");
    /// assert_eq!(key, "site1/tcw241/@/setpoint");
    /// ```
    pub fn setpoint(&self, device: &str) -> String {
        format!("{}/{}/@/setpoint", self.prefix, device)
    }

    /// Key expression on which irrigation demand for a device is received.
    pub fn demand(&self, device: &str) -> String {
        format!("{}/{}/@/demand", self.prefix, device)
    }

    /// Key expression of the supervisor status.
    pub fn status(&self) -> String {
        format!("{}/@/status", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let keys = KeyExprBuilder::default();

        assert_eq!(keys.prefix(), "serre");
        assert_eq!(keys.metric("tcw241", "humidity/h2"), "serre/tcw241/humidity/h2");
        assert_eq!(keys.state("poseidon"), "serre/poseidon/state");
        assert_eq!(keys.demand("poseidon"), "serre/poseidon/@/demand");
        assert_eq!(keys.status(), "serre/@/status");
    }
}
