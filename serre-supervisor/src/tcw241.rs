//! TCW241 environment unit.
//!
//! Air temperature, three soil-humidity probes on 0-5 V analog inputs, and
//! four relays driving misting, heating and the roof window.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{decode_discrete, decode_float32, decode_humidity_from_volts, mean_humidity};
use crate::connection::{ConnectionState, DeviceConnection, DeviceError, DeviceLink};
use crate::regulation::{ClimateCommand, RegulationPlan, Setpoint};

/// Register map of the unit.
pub mod registers {
    /// Holding registers (2, float32 BE), air temperature.
    pub const TEMPERATURE: u16 = 19800;
    /// Holding registers (2 each, float32 BE, volts), humidity probes 1-3.
    pub const HUMIDITY: [u16; 3] = [17500, 17502, 17504];
    /// Coil of relay 1; relays 2-4 follow.
    pub const RELAY_BASE: u16 = 100;
}

/// One of the four relay outputs, numbered 1 to 4 as on the front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Relay {
    R1,
    R2,
    R3,
    R4,
}

impl Relay {
    pub const ALL: [Relay; 4] = [Relay::R1, Relay::R2, Relay::R3, Relay::R4];

    pub fn number(self) -> u8 {
        match self {
            Relay::R1 => 1,
            Relay::R2 => 2,
            Relay::R3 => 3,
            Relay::R4 => 4,
        }
    }

    pub fn coil(self) -> u16 {
        registers::RELAY_BASE + u16::from(self.number()) - 1
    }
}

impl TryFrom<u8> for Relay {
    type Error = String;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        match number {
            1 => Ok(Relay::R1),
            2 => Ok(Relay::R2),
            3 => Ok(Relay::R3),
            4 => Ok(Relay::R4),
            n => Err(format!("relay number must be between 1 and 4, got {}", n)),
        }
    }
}

impl From<Relay> for u8 {
    fn from(relay: Relay) -> Self {
        relay.number()
    }
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay{}", self.number())
    }
}

/// Which relay drives which actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRoles {
    #[serde(default = "default_misting")]
    pub misting: Relay,
    #[serde(default = "default_heating")]
    pub heating: Relay,
    #[serde(default = "default_window")]
    pub window: Relay,
}

fn default_misting() -> Relay {
    Relay::R2
}

fn default_heating() -> Relay {
    Relay::R3
}

fn default_window() -> Relay {
    Relay::R4
}

impl Default for RelayRoles {
    fn default() -> Self {
        Self {
            misting: default_misting(),
            heating: default_heating(),
            window: default_window(),
        }
    }
}

impl RelayRoles {
    /// `true` when every role is bound to a different relay.
    pub fn are_distinct(&self) -> bool {
        self.misting != self.heating && self.misting != self.window && self.heating != self.window
    }
}

/// Observed coil state of the four relays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStates {
    pub relay1: bool,
    pub relay2: bool,
    pub relay3: bool,
    pub relay4: bool,
}

impl RelayStates {
    pub fn get(&self, relay: Relay) -> bool {
        match relay {
            Relay::R1 => self.relay1,
            Relay::R2 => self.relay2,
            Relay::R3 => self.relay3,
            Relay::R4 => self.relay4,
        }
    }

    pub fn set(&mut self, relay: Relay, on: bool) {
        match relay {
            Relay::R1 => self.relay1 = on,
            Relay::R2 => self.relay2 = on,
            Relay::R3 => self.relay3 = on,
            Relay::R4 => self.relay4 = on,
        }
    }
}

/// Temperature and humidity captured in one poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TcwReadings {
    pub temperature: f64,
    pub humidity: [f64; 3],
    pub mean_humidity: f64,
}

impl TcwReadings {
    fn new(temperature: f64, humidity: [f64; 3]) -> Self {
        Self {
            temperature,
            humidity,
            mean_humidity: mean_humidity(humidity[0], humidity[1], humidity[2]),
        }
    }
}

/// Consumer view of the unit. Every value is `null` when unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TcwSnapshot {
    pub temperature: Option<f64>,
    pub h1: Option<f64>,
    pub h2: Option<f64>,
    pub h3: Option<f64>,
    #[serde(rename = "humiditeSol")]
    pub mean_humidity: Option<f64>,
    pub relays: Option<RelayStates>,
    #[serde(rename = "timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    pub connection: ConnectionState,
}

impl TcwSnapshot {
    /// Snapshot with every reading absent.
    pub fn unavailable(connection: ConnectionState) -> Self {
        Self {
            temperature: None,
            h1: None,
            h2: None,
            h3: None,
            mean_humidity: None,
            relays: None,
            updated_at: None,
            connection,
        }
    }

    pub fn is_available(&self) -> bool {
        self.temperature.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TcwCache {
    readings: Option<TcwReadings>,
    relays: Option<RelayStates>,
    updated_at: Option<DateTime<Utc>>,
}

/// Result of one regulation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegulationOutcome {
    pub plan: RegulationPlan,
    /// Relay states observed before any write.
    pub relays_before: RelayStates,
    /// Coil writes issued, in order.
    pub writes: Vec<(Relay, bool)>,
}

/// Driver for one TCW241 unit.
#[derive(Debug)]
pub struct Tcw241 {
    connection: DeviceConnection,
    roles: RelayRoles,
    cache: RwLock<TcwCache>,
}

impl Tcw241 {
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            roles: RelayRoles::default(),
            cache: RwLock::new(TcwCache::default()),
        }
    }

    pub fn with_roles(mut self, roles: RelayRoles) -> Self {
        self.roles = roles;
        self
    }

    pub fn name(&self) -> &str {
        self.connection.name()
    }

    pub fn roles(&self) -> RelayRoles {
        self.roles
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

    /// Open a session, read everything, close the session.
    ///
    /// Any failure yields an all-absent snapshot and leaves the cache alone.
    pub async fn get_all(&self) -> TcwSnapshot {
        let mut link = match self.connection.acquire().await {
            Ok(link) => link,
            Err(e) => {
                debug!(device = %self.name(), error = %e, "No session for poll");
                return TcwSnapshot::unavailable(self.connection.state());
            }
        };
        let result = read_all(&mut link).await;
        link.release().await;

        match result {
            Ok((readings, relays)) => {
                self.store(|cache| {
                    cache.readings = Some(readings);
                    cache.relays = Some(relays);
                });
                debug!(
                    device = %self.name(),
                    temperature = readings.temperature,
                    mean_humidity = readings.mean_humidity,
                    "Readings updated"
                );
                self.snapshot()
            }
            Err(e) => {
                warn!(device = %self.name(), error = %e, "Poll failed");
                TcwSnapshot::unavailable(self.connection.state())
            }
        }
    }

    /// Read the four relay coils.
    pub async fn relay_states(&self) -> Result<RelayStates, DeviceError> {
        let mut link = self.connection.acquire().await?;
        let result = read_relays(&mut link).await;
        link.release().await;

        if let Ok(relays) = result {
            self.set_relays(relays);
        }
        result
    }

    /// Invert one relay and return its new state.
    ///
    /// The read and the write happen under the same device lock, so
    /// concurrent toggles never lose an update.
    pub async fn toggle_relay(&self, relay: Relay) -> Result<bool, DeviceError> {
        let result = self.toggle(relay).await;
        match result {
            Ok(on) => {
                self.remember(&[(relay, on)]);
                info!(device = %self.name(), %relay, on, "Relay toggled");
            }
            Err(ref e) => warn!(device = %self.name(), %relay, error = %e, "Relay toggle failed"),
        }
        result
    }

    async fn toggle(&self, relay: Relay) -> Result<bool, DeviceError> {
        let mut link = self.connection.acquire().await?;
        let result = toggle_coil(&mut link, relay.coil()).await;
        link.release().await;
        result
    }

    /// Run one temperature and humidity regulation pass on the cached readings.
    ///
    /// Relay states are read first, then the writes of the plan are issued in
    /// order. The first failed write aborts the pass.
    pub async fn regulate(&self, setpoint: &Setpoint) -> Result<RegulationOutcome, DeviceError> {
        let readings = self.readings();
        let plan = RegulationPlan::new(
            setpoint,
            readings.map(|r| r.temperature),
            readings.map(|r| r.mean_humidity),
        );
        self.log_plan(&plan);

        let writes = self.planned_writes(&plan);
        let mut done = Vec::with_capacity(writes.len());
        let result = self.apply(&writes, &mut done).await;

        match result {
            Ok(before) => {
                self.set_relays(before);
                self.remember(&done);
                Ok(RegulationOutcome {
                    plan,
                    relays_before: before,
                    writes: done,
                })
            }
            Err(e) => {
                self.remember(&done);
                warn!(device = %self.name(), error = %e, written = done.len(), "Regulation aborted");
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        writes: &[(Relay, bool)],
        done: &mut Vec<(Relay, bool)>,
    ) -> Result<RelayStates, DeviceError> {
        let mut link = self.connection.acquire().await?;
        let result = write_relays(&mut link, writes, done).await;
        link.release().await;
        result
    }

    fn log_plan(&self, plan: &RegulationPlan) {
        if let Some(band) = plan.temperature {
            match plan.climate() {
                Some(command) => info!(
                    device = %self.name(),
                    band = ?band,
                    heating = command.heating,
                    window = command.window,
                    "Temperature regulation"
                ),
                None => debug!(device = %self.name(), band = ?band, "Temperature in hold band"),
            }
        }
        if let Some(band) = plan.humidity {
            match plan.misting() {
                Some(on) => info!(device = %self.name(), band = ?band, misting = on, "Humidity regulation"),
                None => debug!(device = %self.name(), band = ?band, "Humidity in hold band"),
            }
        }
    }

    /// Coil writes for a plan, in the order they must reach the device.
    pub fn planned_writes(&self, plan: &RegulationPlan) -> Vec<(Relay, bool)> {
        let mut writes = Vec::new();
        if let Some(command) = plan.climate() {
            writes.extend(self.climate_writes(command));
        }
        if let Some(on) = plan.misting() {
            writes.push((self.roles.misting, on));
        }
        writes
    }

    /// The window is closed before heating starts, and heating stops before
    /// the window opens.
    fn climate_writes(&self, command: ClimateCommand) -> [(Relay, bool); 2] {
        if command.heating {
            [(self.roles.window, false), (self.roles.heating, true)]
        } else {
            [
                (self.roles.heating, false),
                (self.roles.window, command.window),
            ]
        }
    }

    pub fn readings(&self) -> Option<TcwReadings> {
        self.cache.read().map(|c| c.readings).unwrap_or(None)
    }

    /// Cached view of the unit.
    pub fn snapshot(&self) -> TcwSnapshot {
        let cache = self.cache.read().map(|c| *c).unwrap_or_default();
        let readings = cache.readings;
        TcwSnapshot {
            temperature: readings.map(|r| r.temperature),
            h1: readings.map(|r| r.humidity[0]),
            h2: readings.map(|r| r.humidity[1]),
            h3: readings.map(|r| r.humidity[2]),
            mean_humidity: readings.map(|r| r.mean_humidity),
            relays: cache.relays,
            updated_at: cache.updated_at,
            connection: self.connection.state(),
        }
    }

    fn store(&self, update: impl FnOnce(&mut TcwCache)) {
        if let Ok(mut cache) = self.cache.write() {
            update(&mut cache);
            cache.updated_at = Some(Utc::now());
        }
    }

    fn set_relays(&self, relays: RelayStates) {
        if let Ok(mut cache) = self.cache.write() {
            cache.relays = Some(relays);
        }
    }

    /// Record commanded relay states on top of the cached ones.
    fn remember(&self, writes: &[(Relay, bool)]) {
        if writes.is_empty() {
            return;
        }
        if let Ok(mut cache) = self.cache.write() {
            if let Some(relays) = cache.relays.as_mut() {
                for &(relay, on) in writes {
                    relays.set(relay, on);
                }
            }
        }
    }
}

async fn read_float(link: &mut DeviceLink<'_>, address: u16) -> Result<f64, DeviceError> {
    let words = link.read_holding_registers(address, 2).await?;
    match words.as_slice() {
        [high, low, ..] => Ok(f64::from(decode_float32(*high, *low))),
        _ => Err(DeviceError::Transport(format!(
            "short response at register {}",
            address
        ))),
    }
}

async fn read_coil(link: &mut DeviceLink<'_>, coil: u16) -> Result<bool, DeviceError> {
    match link.read_coils(coil, 1).await?.as_slice() {
        [bit, ..] => Ok(decode_discrete(*bit)),
        [] => Err(DeviceError::Transport(format!(
            "empty response at coil {}",
            coil
        ))),
    }
}

async fn read_relays(link: &mut DeviceLink<'_>) -> Result<RelayStates, DeviceError> {
    let mut states = RelayStates::default();
    for relay in Relay::ALL {
        states.set(relay, read_coil(link, relay.coil()).await?);
    }
    Ok(states)
}

async fn read_all(link: &mut DeviceLink<'_>) -> Result<(TcwReadings, RelayStates), DeviceError> {
    let temperature = read_float(link, registers::TEMPERATURE).await?;
    let mut humidity = [0.0; 3];
    for (slot, address) in humidity.iter_mut().zip(registers::HUMIDITY) {
        *slot = decode_humidity_from_volts(read_float(link, address).await?);
    }
    let relays = read_relays(link).await?;
    Ok((TcwReadings::new(temperature, humidity), relays))
}

async fn toggle_coil(link: &mut DeviceLink<'_>, coil: u16) -> Result<bool, DeviceError> {
    let next = !read_coil(link, coil).await?;
    link.write_single_coil(coil, next).await?;
    Ok(next)
}

async fn write_relays(
    link: &mut DeviceLink<'_>,
    writes: &[(Relay, bool)],
    done: &mut Vec<(Relay, bool)>,
) -> Result<RelayStates, DeviceError> {
    let before = read_relays(link).await?;
    for &(relay, on) in writes {
        link.write_single_coil(relay.coil(), on).await?;
        done.push((relay, on));
    }
    Ok(before)
}
