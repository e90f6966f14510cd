//! Poseidon water-management unit.
//!
//! Caches outdoor temperature, tank level and flow-meter pulses, and drives
//! the pump and the rain-water valve.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{decode_counter, decode_discrete, decode_scaled};
use crate::connection::{ConnectionState, DeviceConnection, DeviceError, DeviceLink};
use crate::regulation::{WaterSource, choose_water_source, pump_command};

/// Register map of the unit.
pub mod registers {
    /// Holding register, signed, outdoor temperature.
    pub const TEMPERATURE: u16 = 5;
    /// Holding register, flow-meter pulse count.
    pub const PULSE_COUNTER: u16 = 1;
    /// Discrete input, tank float switch.
    pub const TANK_LEVEL: u16 = 100;
    /// Coil, irrigation pump.
    pub const PUMP: u16 = 151;
    /// Coil, rain-water valve (on = rain tank, off = mains).
    pub const RAIN_VALVE: u16 = 152;
}

pub const DEFAULT_LITRES_PER_PULSE: f64 = 1.0;

/// One complete, successful read of the unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoseidonReadings {
    pub temperature: f64,
    pub tank_full: bool,
    pub pulses: u32,
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    readings: PoseidonReadings,
    updated_at: DateTime<Utc>,
}

/// Cached view of the unit, `null` where nothing was read yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoseidonSnapshot {
    pub temperature: Option<f64>,
    pub tank_full: Option<bool>,
    pub pulses: Option<u32>,
    pub consumption_litres: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub connection: ConnectionState,
}

/// Outcome of one poll-and-regulate cycle whose reads succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseidonCycle {
    pub readings: PoseidonReadings,
    pub water_source: Result<WaterSource, DeviceError>,
    pub pump: Result<bool, DeviceError>,
}

/// Driver for one Poseidon unit.
#[derive(Debug)]
pub struct Poseidon {
    connection: DeviceConnection,
    litres_per_pulse: f64,
    temperature_scale: f64,
    cache: RwLock<Option<Cached>>,
}

impl Poseidon {
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            litres_per_pulse: DEFAULT_LITRES_PER_PULSE,
            temperature_scale: 1.0,
            cache: RwLock::new(None),
        }
    }

    /// Volume of water per flow-meter pulse.
    pub fn with_litres_per_pulse(mut self, litres: f64) -> Self {
        self.litres_per_pulse = litres;
        self
    }

    /// Factor applied to the raw temperature register (0.1 for tenths of a degree).
    pub fn with_temperature_scale(mut self, scale: f64) -> Self {
        self.temperature_scale = scale;
        self
    }

    pub fn name(&self) -> &str {
        self.connection.name()
    }

    pub fn connection(&self) -> &DeviceConnection {
        &self.connection
    }

    pub async fn connect(&self) -> Result<(), DeviceError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Read every register of interest and replace the cache.
    ///
    /// The cache is only touched when all reads succeed.
    pub async fn update_all(&self) -> Result<PoseidonReadings, DeviceError> {
        let mut link = self.connection.lock().await;
        self.refresh(&mut link).await
    }

    /// Poll, then run both regulation functions on the fresh values.
    ///
    /// The device stays locked for the whole cycle. When the reads fail no
    /// write is issued.
    pub async fn poll_cycle(&self, demand: bool) -> Result<PoseidonCycle, DeviceError> {
        let mut link = self.connection.lock().await;
        let readings = self.refresh(&mut link).await?;

        let water_source = self.apply_water_source(&mut link).await;
        let pump = self.apply_pump(&mut link, demand).await;

        Ok(PoseidonCycle {
            readings,
            water_source,
            pump,
        })
    }

    async fn refresh(&self, link: &mut DeviceLink<'_>) -> Result<PoseidonReadings, DeviceError> {
        match self.read_all(link).await {
            Ok(readings) => {
                let cached = Cached {
                    readings,
                    updated_at: Utc::now(),
                };
                if let Ok(mut cache) = self.cache.write() {
                    *cache = Some(cached);
                }
                debug!(
                    device = %self.name(),
                    temperature = readings.temperature,
                    tank_full = readings.tank_full,
                    pulses = readings.pulses,
                    "Readings updated"
                );
                Ok(readings)
            }
            Err(e) => {
                warn!(device = %self.name(), error = %e, "Read failed, keeping last readings");
                Err(e)
            }
        }
    }

    async fn read_all(&self, link: &mut DeviceLink<'_>) -> Result<PoseidonReadings, DeviceError> {
        let temperature = read_word(link, registers::TEMPERATURE).await?;
        let counter = read_word(link, registers::PULSE_COUNTER).await?;
        let level = match link.read_discrete_inputs(registers::TANK_LEVEL, 1).await?.as_slice() {
            [bit, ..] => *bit,
            [] => return Err(short_response(registers::TANK_LEVEL)),
        };

        Ok(PoseidonReadings {
            temperature: decode_scaled(temperature, self.temperature_scale),
            pulses: decode_counter(counter),
            tank_full: decode_discrete(level),
        })
    }

    fn cached(&self) -> Option<Cached> {
        self.cache.read().map(|c| *c).unwrap_or(None)
    }

    /// Last known readings, if any poll ever succeeded.
    pub fn readings(&self) -> Option<PoseidonReadings> {
        self.cached().map(|c| c.readings)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.readings().map(|r| r.temperature)
    }

    pub fn is_tank_full(&self) -> Option<bool> {
        self.readings().map(|r| r.tank_full)
    }

    pub fn pulses(&self) -> Option<u32> {
        self.readings().map(|r| r.pulses)
    }

    /// Water consumed since the meter was reset, in litres.
    pub fn consumption_litres(&self) -> Option<f64> {
        self.pulses()
            .map(|pulses| f64::from(pulses) * self.litres_per_pulse)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.cached().map(|c| c.updated_at)
    }

    pub fn snapshot(&self) -> PoseidonSnapshot {
        PoseidonSnapshot {
            temperature: self.temperature(),
            tank_full: self.is_tank_full(),
            pulses: self.pulses(),
            consumption_litres: self.consumption_litres(),
            updated_at: self.updated_at(),
            connection: self.connection.state(),
        }
    }

    pub async fn set_pump(&self, on: bool) -> Result<(), DeviceError> {
        let mut link = self.connection.lock().await;
        self.write_pump(&mut link, on).await
    }

    pub async fn set_water_source(&self, source: WaterSource) -> Result<(), DeviceError> {
        let mut link = self.connection.lock().await;
        self.write_water_source(&mut link, source).await
    }

    /// Select the water network from the cached readings.
    pub async fn manage_network(&self) -> Result<WaterSource, DeviceError> {
        let mut link = self.connection.lock().await;
        self.apply_water_source(&mut link).await
    }

    /// Switch the pump for the given irrigation demand.
    pub async fn manage_pump(&self, demand: bool) -> Result<bool, DeviceError> {
        let mut link = self.connection.lock().await;
        self.apply_pump(&mut link, demand).await
    }

    async fn apply_water_source(
        &self,
        link: &mut DeviceLink<'_>,
    ) -> Result<WaterSource, DeviceError> {
        let source = choose_water_source(self.temperature(), self.is_tank_full());
        self.write_water_source(link, source).await?;
        Ok(source)
    }

    async fn apply_pump(&self, link: &mut DeviceLink<'_>, demand: bool) -> Result<bool, DeviceError> {
        let on = pump_command(demand, self.temperature(), self.is_tank_full());
        self.write_pump(link, on).await?;
        Ok(on)
    }

    async fn write_pump(&self, link: &mut DeviceLink<'_>, on: bool) -> Result<(), DeviceError> {
        match link.write_single_coil(registers::PUMP, on).await {
            Ok(()) => {
                info!(device = %self.name(), on, "Pump switched");
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.name(), on, error = %e, "Failed to switch pump");
                Err(e)
            }
        }
    }

    async fn write_water_source(
        &self,
        link: &mut DeviceLink<'_>,
        source: WaterSource,
    ) -> Result<(), DeviceError> {
        match link
            .write_single_coil(registers::RAIN_VALVE, source.valve_open())
            .await
        {
            Ok(()) => {
                info!(device = %self.name(), source = ?source, "Water network selected");
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.name(), source = ?source, error = %e, "Failed to switch rain valve");
                Err(e)
            }
        }
    }
}

async fn read_word(link: &mut DeviceLink<'_>, address: u16) -> Result<u16, DeviceError> {
    match link.read_holding_registers(address, 1).await?.as_slice() {
        [word, ..] => Ok(*word),
        [] => Err(short_response(address)),
    }
}

fn short_response(address: u16) -> DeviceError {
    DeviceError::Transport(format!("short response at register {}", address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    async fn connected(device: &SimDevice) -> Poseidon {
        let poseidon = Poseidon::new(device.connection("poseidon"));
        poseidon.connect().await.unwrap();
        poseidon
    }

    #[tokio::test]
    async fn test_cache_starts_unknown() {
        let poseidon = Poseidon::new(SimDevice::poseidon().connection("poseidon"));

        assert_eq!(poseidon.temperature(), None);
        assert_eq!(poseidon.is_tank_full(), None);
        assert_eq!(poseidon.pulses(), None);
        assert_eq!(poseidon.consumption_litres(), None);
        assert_eq!(poseidon.snapshot().connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_update_all_fills_cache() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await;

        let readings = poseidon.update_all().await.unwrap();
        assert_eq!(
            readings,
            PoseidonReadings {
                temperature: 12.0,
                tank_full: true,
                pulses: 340
            }
        );
        assert_eq!(poseidon.temperature(), Some(12.0));
        assert_eq!(poseidon.is_tank_full(), Some(true));
        assert_eq!(poseidon.consumption_litres(), Some(340.0));
        assert!(poseidon.updated_at().is_some());
    }

    #[tokio::test]
    async fn test_consumption_follows_latest_pulses() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await.with_litres_per_pulse(2.5);

        for pulses in [0u16, 17, 4000, 65535] {
            device.with(|r| r.holding.insert(registers::PULSE_COUNTER, pulses));
            poseidon.update_all().await.unwrap();
            assert_eq!(poseidon.consumption_litres(), Some(f64::from(pulses) * 2.5));
        }
    }

    #[tokio::test]
    async fn test_failed_read_keeps_previous_values() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await;
        poseidon.update_all().await.unwrap();
        let before = poseidon.snapshot();

        // New values on the device, but the second read of the cycle fails
        device.with(|r| {
            r.holding.insert(registers::TEMPERATURE, 30);
            r.holding.insert(registers::PULSE_COUNTER, 999);
            r.discrete.insert(registers::TANK_LEVEL, false);
            r.fail_address = Some(registers::PULSE_COUNTER);
        });

        assert!(poseidon.update_all().await.is_err());
        assert_eq!(poseidon.temperature(), before.temperature);
        assert_eq!(poseidon.pulses(), before.pulses);
        assert_eq!(poseidon.is_tank_full(), before.tank_full);
        assert_eq!(poseidon.updated_at(), before.updated_at);
        assert!(!poseidon.is_connected());
    }

    #[tokio::test]
    async fn test_short_response_is_an_error() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await;
        poseidon.update_all().await.unwrap();

        for address in [registers::TEMPERATURE, registers::PULSE_COUNTER, registers::TANK_LEVEL] {
            device.with(|r| r.empty_address = Some(address));
            poseidon.connect().await.unwrap();

            assert!(matches!(
                poseidon.update_all().await,
                Err(DeviceError::Transport(_))
            ));
            assert_eq!(poseidon.pulses(), Some(340));
        }

        // The unit answers properly again
        device.with(|r| r.empty_address = None);
        poseidon.connect().await.unwrap();
        assert!(poseidon.update_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_update_without_session_is_rejected() {
        let poseidon = Poseidon::new(SimDevice::poseidon().connection("poseidon"));

        assert_eq!(poseidon.update_all().await, Err(DeviceError::NotConnected));
        assert_eq!(poseidon.readings(), None);
    }

    #[tokio::test]
    async fn test_negative_and_scaled_temperature() {
        let device = SimDevice::poseidon();
        device.with(|r| r.holding.insert(registers::TEMPERATURE, (-35i16) as u16));
        let poseidon = connected(&device).await.with_temperature_scale(0.1);

        poseidon.update_all().await.unwrap();
        assert_eq!(poseidon.temperature(), Some(-3.5));
    }

    #[tokio::test]
    async fn test_manage_network_uses_rain_when_safe() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await;
        poseidon.update_all().await.unwrap();

        assert_eq!(poseidon.manage_network().await, Ok(WaterSource::Rain));
        assert!(device.with(|r| r.coil(registers::RAIN_VALVE)));

        device.with(|r| r.holding.insert(registers::TEMPERATURE, 0));
        poseidon.update_all().await.unwrap();
        assert_eq!(poseidon.manage_network().await, Ok(WaterSource::Mains));
        assert!(!device.with(|r| r.coil(registers::RAIN_VALVE)));
    }

    #[tokio::test]
    async fn test_manage_network_before_first_poll_falls_back_to_mains() {
        let device = SimDevice::poseidon();
        device.with(|r| r.coils.insert(registers::RAIN_VALVE, true));
        let poseidon = connected(&device).await;

        assert_eq!(poseidon.manage_network().await, Ok(WaterSource::Mains));
        assert!(!device.with(|r| r.coil(registers::RAIN_VALVE)));
    }

    #[tokio::test]
    async fn test_manage_pump_overrides() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await;
        poseidon.update_all().await.unwrap();

        assert_eq!(poseidon.manage_pump(true).await, Ok(true));
        assert!(device.with(|r| r.coil(registers::PUMP)));
        assert_eq!(poseidon.manage_pump(false).await, Ok(false));
        assert!(!device.with(|r| r.coil(registers::PUMP)));

        device.with(|r| r.discrete.insert(registers::TANK_LEVEL, false));
        poseidon.update_all().await.unwrap();
        assert_eq!(poseidon.manage_pump(true).await, Ok(false));
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_not_raised() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await;
        device.with(|r| r.fail_address = Some(registers::PUMP));

        assert!(matches!(
            poseidon.set_pump(true).await,
            Err(DeviceError::Transport(_))
        ));
        // The session is gone, later writes short-circuit
        assert_eq!(
            poseidon.set_water_source(WaterSource::Rain).await,
            Err(DeviceError::NotConnected)
        );
        assert!(device.with(|r| r.writes.is_empty()));
    }

    #[tokio::test]
    async fn test_poll_cycle_regulates_on_fresh_values() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await;

        let cycle = poseidon.poll_cycle(true).await.unwrap();
        assert_eq!(cycle.readings.pulses, 340);
        assert_eq!(cycle.water_source, Ok(WaterSource::Rain));
        assert_eq!(cycle.pump, Ok(true));
        assert_eq!(
            device.with(|r| r.writes.clone()),
            vec![(registers::RAIN_VALVE, true), (registers::PUMP, true)]
        );
    }

    #[tokio::test]
    async fn test_poll_cycle_without_readings_writes_nothing() {
        let device = SimDevice::poseidon();
        let poseidon = connected(&device).await;
        device.with(|r| r.fail_address = Some(registers::TANK_LEVEL));

        assert!(poseidon.poll_cycle(true).await.is_err());
        assert!(device.with(|r| r.writes.is_empty()));
    }
}
