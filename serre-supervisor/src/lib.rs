//! Greenhouse supervisor.
//!
//! Polls a Poseidon water-management unit and a TCW241 environment unit over
//! Modbus TCP, keeps a cache of their last good readings, and drives pump,
//! rain valve, misting, heating and window from threshold rules.
//!
//! # Key Expressions
//!
//! ```text
//! serre/<device>/state          full snapshot (JSON, null for unknown values)
//! serre/<device>/<metric>       one telemetry point per known value
//! serre/<tcw>/@/setpoint        setpoint input {temperature, humidite}
//! serre/<poseidon>/@/demand     irrigation demand input (true/false)
//! serre/@/status                supervisor status
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod inputs;
pub mod poller;
pub mod poseidon;
pub mod regulation;
pub mod sim;
pub mod tcw241;
