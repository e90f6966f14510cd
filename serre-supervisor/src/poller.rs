//! Periodic poll-and-regulate loops, one per device.
//!
//! Each loop owns a `tokio::time::interval` with
//! [`MissedTickBehavior::Delay`], so a slow cycle pushes the next one back
//! instead of overlapping it. Inputs that change between cycles (irrigation
//! demand, setpoints) arrive through `watch` channels.

use std::sync::Arc;
use std::time::Duration;

use serre_common::publisher::Publisher;
use serre_common::telemetry::{DeviceKind, TelemetryPoint, TelemetryValue};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connection::DeviceError;
use crate::poseidon::{Poseidon, PoseidonCycle, PoseidonSnapshot};
use crate::regulation::Setpoint;
use crate::tcw241::{Relay, RegulationOutcome, Tcw241, TcwSnapshot};

/// Polls a Poseidon unit and applies water regulation.
pub struct PoseidonPoller {
    device: Arc<Poseidon>,
    interval: Duration,
    demand: watch::Receiver<bool>,
    publisher: Option<Publisher>,
}

impl PoseidonPoller {
    pub fn new(device: Arc<Poseidon>, interval: Duration, demand: watch::Receiver<bool>) -> Self {
        Self {
            device,
            interval,
            demand,
            publisher: None,
        }
    }

    /// Publish readings after every cycle.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Run the polling loop.
    pub async fn run(self) {
        info!(
            device = %self.device.name(),
            endpoint = %self.device.connection().endpoint(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting Poseidon poller"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                debug!(device = %self.device.name(), error = %e, "Cycle skipped");
            }
        }
    }

    /// One cycle: reconnect if needed, read, regulate, publish.
    pub async fn poll_once(&self) -> Result<PoseidonCycle, DeviceError> {
        let result = self.cycle().await;
        self.publish(result.as_ref().ok()).await;
        result
    }

    async fn cycle(&self) -> Result<PoseidonCycle, DeviceError> {
        if !self.device.is_connected() {
            self.device.connect().await?;
        }
        let demand = *self.demand.borrow();
        self.device.poll_cycle(demand).await
    }

    async fn publish(&self, cycle: Option<&PoseidonCycle>) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let name = self.device.name();
        let snapshot = self.device.snapshot();

        if let Err(e) = publisher
            .publish_json(&publisher.keys().state(name), &snapshot)
            .await
        {
            warn!(device = %name, error = %e, "Failed to publish state");
        }

        let mut points = poseidon_points(name, &snapshot);
        if let Some(cycle) = cycle {
            points.extend(command_points(name, cycle));
        }
        let published = publisher.publish_points(&points).await;
        debug!(device = %name, published, "Published telemetry");
    }
}

/// Polls a TCW241 unit and applies climate regulation.
pub struct TcwPoller {
    device: Arc<Tcw241>,
    interval: Duration,
    setpoint: watch::Receiver<Setpoint>,
    publisher: Option<Publisher>,
}

/// Outcome of one TCW241 cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TcwCycle {
    pub snapshot: TcwSnapshot,
    /// `None` when the poll failed and regulation was skipped.
    pub regulation: Option<Result<RegulationOutcome, DeviceError>>,
}

impl TcwPoller {
    pub fn new(device: Arc<Tcw241>, interval: Duration, setpoint: watch::Receiver<Setpoint>) -> Self {
        Self {
            device,
            interval,
            setpoint,
            publisher: None,
        }
    }

    /// Publish readings after every cycle.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Run the polling loop.
    pub async fn run(self) {
        info!(
            device = %self.device.name(),
            endpoint = %self.device.connection().endpoint(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting TCW241 poller"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let cycle = self.poll_once().await;
            if let Some(Ok(outcome)) = &cycle.regulation {
                debug!(device = %self.device.name(), writes = outcome.writes.len(), "Cycle complete");
            }
        }
    }

    /// One cycle: read everything, publish, then regulate on the fresh readings.
    pub async fn poll_once(&self) -> TcwCycle {
        let snapshot = self.device.get_all().await;
        self.publish(&snapshot).await;

        let regulation = if snapshot.is_available() {
            let setpoint = *self.setpoint.borrow();
            Some(self.device.regulate(&setpoint).await)
        } else {
            None
        };

        TcwCycle {
            snapshot,
            regulation,
        }
    }

    async fn publish(&self, snapshot: &TcwSnapshot) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let name = self.device.name();

        if let Err(e) = publisher
            .publish_json(&publisher.keys().state(name), snapshot)
            .await
        {
            warn!(device = %name, error = %e, "Failed to publish state");
        }

        let points = tcw_points(name, snapshot);
        let published = publisher.publish_points(&points).await;
        debug!(device = %name, published, "Published telemetry");
    }
}

/// Telemetry points for the known values of a Poseidon snapshot.
///
/// Unknown values produce no point at all rather than a zero.
pub fn poseidon_points(name: &str, snapshot: &PoseidonSnapshot) -> Vec<TelemetryPoint> {
    let Some(updated_at) = snapshot.updated_at else {
        return Vec::new();
    };
    let timestamp = updated_at.timestamp_millis();
    let point = |metric: &str, value: TelemetryValue| {
        TelemetryPoint::new(name, DeviceKind::Poseidon, metric, value).at(timestamp)
    };

    let mut points = Vec::new();
    if let Some(t) = snapshot.temperature {
        points.push(point("temperature", t.into()).with_label("unit", "°C"));
    }
    if let Some(full) = snapshot.tank_full {
        points.push(point("tank_full", full.into()));
    }
    if let Some(pulses) = snapshot.pulses {
        points.push(point("pulses", pulses.into()));
    }
    if let Some(litres) = snapshot.consumption_litres {
        points.push(point("consumption", litres.into()).with_label("unit", "L"));
    }
    points
}

fn command_points(name: &str, cycle: &PoseidonCycle) -> Vec<TelemetryPoint> {
    let mut points = Vec::new();
    if let Ok(source) = cycle.water_source {
        points.push(TelemetryPoint::new(
            name,
            DeviceKind::Poseidon,
            "rain_valve",
            source.valve_open().into(),
        ));
    }
    if let Ok(on) = cycle.pump {
        points.push(TelemetryPoint::new(
            name,
            DeviceKind::Poseidon,
            "pump",
            on.into(),
        ));
    }
    points
}

/// Telemetry points for the known values of a TCW241 snapshot.
pub fn tcw_points(name: &str, snapshot: &TcwSnapshot) -> Vec<TelemetryPoint> {
    let Some(updated_at) = snapshot.updated_at else {
        return Vec::new();
    };
    let timestamp = updated_at.timestamp_millis();
    let point = |metric: String, value: TelemetryValue| {
        TelemetryPoint::new(name, DeviceKind::Tcw241, metric, value).at(timestamp)
    };

    let mut points = Vec::new();
    if let Some(t) = snapshot.temperature {
        points.push(point("temperature".to_string(), t.into()).with_label("unit", "°C"));
    }
    for (channel, value) in [("h1", snapshot.h1), ("h2", snapshot.h2), ("h3", snapshot.h3)] {
        if let Some(h) = value {
            points.push(point(format!("humidity/{}", channel), h.into()).with_label("unit", "%"));
        }
    }
    if let Some(mean) = snapshot.mean_humidity {
        points.push(point("humidity/mean".to_string(), mean.into()).with_label("unit", "%"));
    }
    if let Some(relays) = snapshot.relays {
        for relay in Relay::ALL {
            points.push(point(
                format!("relay/{}", relay.number()),
                relays.get(relay).into(),
            ));
        }
    }
    points
}
