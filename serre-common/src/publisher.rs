//! Zenoh session opening and publishing.

use std::sync::Arc;

use serde::Serialize;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};
use crate::keyexpr::KeyExprBuilder;
use crate::serialization::{Format, encode};
use crate::telemetry::TelemetryPoint;

/// Translate the supervisor's Zenoh settings into a `zenoh::Config`.
pub fn zenoh_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    let mut zenoh_config = zenoh::Config::default();

    let mode = match config.mode.as_str() {
        "client" | "peer" | "router" => format!("\"{}\"", config.mode),
        other => {
            return Err(Error::Config(format!(
                "Invalid Zenoh mode: '{}'. Expected 'client', 'peer', or 'router'",
                other
            )));
        }
    };
    zenoh_config
        .insert_json5("mode", &mode)
        .map_err(|e| Error::Config(format!("Failed to set mode: {}", e)))?;

    for (path, endpoints) in [
        ("connect/endpoints", &config.connect),
        ("listen/endpoints", &config.listen),
    ] {
        if endpoints.is_empty() {
            continue;
        }
        let json = serde_json::to_string(endpoints)?;
        zenoh_config
            .insert_json5(path, &json)
            .map_err(|e| Error::Config(format!("Failed to set {}: {}", path, e)))?;
    }

    Ok(zenoh_config)
}

/// Open a Zenoh session using the provided configuration.
pub async fn connect(config: &ZenohConfig) -> Result<zenoh::Session> {
    let zenoh_config = zenoh_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Connecting to Zenoh"
    );

    let session = zenoh::open(zenoh_config).await?;

    tracing::info!(zid = %session.zid(), "Connected to Zenoh");

    Ok(session)
}

/// Publisher for sending device readings to Zenoh.
///
/// Wraps a Zenoh session together with the key layout and the telemetry
/// encoding chosen in configuration.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    keys: KeyExprBuilder,
    format: Format,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(session: Arc<zenoh::Session>, keys: KeyExprBuilder, format: Format) -> Self {
        Self {
            session,
            keys,
            format,
        }
    }

    /// Key layout used by this publisher.
    pub fn keys(&self) -> &KeyExprBuilder {
        &self.keys
    }

    /// Publish a telemetry point under `<prefix>/<source>/<metric>`.
    pub async fn publish_point(&self, point: &TelemetryPoint) -> Result<()> {
        let key = self.keys.metric(&point.source, &point.metric);
        let payload = encode(point, self.format)?;
        self.put(key, payload).await
    }

    /// Publish a batch of telemetry points.
    ///
    /// Failures are logged; returns the number of points that were published.
    pub async fn publish_points(&self, points: &[TelemetryPoint]) -> usize {
        let mut published = 0;
        for point in points {
            match self.publish_point(point).await {
                Ok(()) => published += 1,
                Err(e) => tracing::warn!(metric = %point.metric, error = %e, "Failed to publish telemetry"),
            }
        }
        published
    }

    /// Publish a JSON document to a full key.
    ///
    /// Snapshots and status documents are always JSON so that absent readings
    /// appear as explicit `null`s for consumers.
    pub async fn publish_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.put(key.to_string(), payload).await
    }

    async fn put(&self, key: String, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(&key, payload)
            .await
            .map_err(|e| Error::Publish {
                key: key.clone(),
                message: e.to_string(),
            })
    }
}
