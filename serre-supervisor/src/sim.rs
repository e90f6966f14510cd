//! In-memory Modbus devices.
//!
//! Used by the test suites and by `--simulate` to run the supervisor without
//! field hardware. A [`SimDevice`] is a shared register bank plus a few fault
//! switches; cloning it shares the same bank.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::codec::encode_float32;
use crate::connection::{Connector, DeviceConnection, DeviceError, Endpoint, RegisterBus};
use crate::poseidon::registers as poseidon_reg;
use crate::tcw241::registers as tcw_reg;

/// Register bank and fault switches of a simulated device.
#[derive(Debug)]
pub struct SimRegisters {
    pub holding: HashMap<u16, u16>,
    pub discrete: HashMap<u16, bool>,
    pub coils: HashMap<u16, bool>,
    /// Refuse new connections.
    pub reachable: bool,
    /// Any access to this address fails with a transport error.
    pub fail_address: Option<u16>,
    /// Reads at this address return no values.
    pub empty_address: Option<u16>,
    /// Calls never complete.
    pub hang: bool,
    pub connects: usize,
    /// Graceful disconnects.
    pub disconnects: usize,
    /// Sessions torn down, gracefully or not.
    pub closed: usize,
    /// Coil writes in the order they reached the device.
    pub writes: Vec<(u16, bool)>,
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self {
            holding: HashMap::new(),
            discrete: HashMap::new(),
            coils: HashMap::new(),
            reachable: true,
            fail_address: None,
            empty_address: None,
            hang: false,
            connects: 0,
            disconnects: 0,
            closed: 0,
            writes: Vec::new(),
        }
    }
}

impl SimRegisters {
    /// Store a float across two holding registers, high word first.
    pub fn set_float(&mut self, address: u16, value: f32) {
        let [high, low] = encode_float32(value);
        self.holding.insert(address, high);
        self.holding.insert(address + 1, low);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.coils.get(&address).copied().unwrap_or(false)
    }

    fn check(&self, address: u16, count: u16) -> Result<(), DeviceError> {
        match self.fail_address {
            Some(bad) if (address..address.saturating_add(count)).contains(&bad) => Err(
                DeviceError::Transport(format!("simulated failure at address {}", bad)),
            ),
            _ => Ok(()),
        }
    }

    fn answers(&self, address: u16, count: u16) -> u16 {
        if self.empty_address == Some(address) {
            0
        } else {
            count
        }
    }
}

/// A simulated device; also its own [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct SimDevice {
    registers: Arc<Mutex<SimRegisters>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A water unit with a full tank, 12 °C outside and 340 pulses counted.
    pub fn poseidon() -> Self {
        let device = Self::new();
        device.with(|r| {
            r.holding.insert(poseidon_reg::TEMPERATURE, 12);
            r.holding.insert(poseidon_reg::PULSE_COUNTER, 340);
            r.discrete.insert(poseidon_reg::TANK_LEVEL, true);
        });
        device
    }

    /// An environment unit at 19.2 °C with humidity channels around 55 %.
    pub fn tcw241() -> Self {
        let device = Self::new();
        device.with(|r| {
            r.set_float(tcw_reg::TEMPERATURE, 19.2);
            r.set_float(tcw_reg::HUMIDITY[0], 2.70);
            r.set_float(tcw_reg::HUMIDITY[1], 2.80);
            r.set_float(tcw_reg::HUMIDITY[2], 2.75);
        });
        device
    }

    /// Run `f` with the register bank locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut SimRegisters) -> R) -> R {
        let mut registers = match self.registers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut registers)
    }

    /// A connection to this device with a short timeout.
    pub fn connection(&self, name: &str) -> DeviceConnection {
        DeviceConnection::new(
            name,
            Endpoint::new("simulator", 502, 1),
            Arc::new(self.clone()),
            Duration::from_millis(200),
        )
    }
}

#[async_trait]
impl Connector for SimDevice {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn RegisterBus>, DeviceError> {
        self.with(|r| {
            if r.reachable {
                r.connects += 1;
                Ok(())
            } else {
                Err(DeviceError::Connect("connection refused".to_string()))
            }
        })?;
        Ok(Box::new(SimBus {
            device: self.clone(),
        }))
    }
}

struct SimBus {
    device: SimDevice,
}

impl SimBus {
    /// Suspend like a network round-trip would.
    async fn round_trip(&self) {
        if self.device.with(|r| r.hang) {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl RegisterBus for SimBus {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DeviceError> {
        self.round_trip().await;
        self.device.with(|r| {
            r.check(address, count)?;
            Ok((0..r.answers(address, count))
                .map(|i| r.holding.get(&(address + i)).copied().unwrap_or(0))
                .collect())
        })
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, DeviceError> {
        self.round_trip().await;
        self.device.with(|r| {
            r.check(address, count)?;
            Ok((0..r.answers(address, count))
                .map(|i| r.discrete.get(&(address + i)).copied().unwrap_or(false))
                .collect())
        })
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, DeviceError> {
        self.round_trip().await;
        self.device.with(|r| {
            r.check(address, count)?;
            Ok((0..r.answers(address, count))
                .map(|i| r.coil(address + i))
                .collect())
        })
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), DeviceError> {
        self.round_trip().await;
        self.device.with(|r| {
            r.check(address, 1)?;
            r.coils.insert(address, value);
            r.writes.push((address, value));
            Ok(())
        })
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.device.with(|r| r.disconnects += 1);
        Ok(())
    }
}

impl Drop for SimBus {
    fn drop(&mut self) {
        self.device.with(|r| r.closed += 1);
    }
}
