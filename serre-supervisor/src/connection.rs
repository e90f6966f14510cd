//! Modbus session management for a single field device.
//!
//! A [`DeviceConnection`] owns at most one live session to its device and
//! serializes every register access behind one async mutex: a poll cycle, a
//! relay toggle or a regulation pass holds a [`DeviceLink`] for its whole
//! duration, so read-modify-write sequences cannot interleave.
//!
//! Transport failures never escape as panics. They surface as
//! [`DeviceError`] values, drop the session and move the connection to
//! [`ConnectionState::Failed`]; the next `connect`/`acquire` retries.
//!
//! A scoped session from [`DeviceConnection::acquire`] is closed when its
//! link is released or dropped, so a cancelled caller never leaks it.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

/// Network location and unit id of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// Liveness of a device session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Never opened, or closed on purpose.
    #[default]
    Disconnected,
    /// Session open and usable.
    Connected,
    /// Last connect or I/O attempt failed; retried on the next attempt.
    Failed,
}

/// Error type for device operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not connected")]
    NotConnected,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Modbus exception: {0}")]
    Exception(String),
}

impl DeviceError {
    /// Whether the error means the session itself is unusable.
    ///
    /// A Modbus exception is a valid answer from a live device and keeps the
    /// session open.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DeviceError::Timeout { .. } | DeviceError::Transport(_) | DeviceError::Connect(_)
        )
    }
}

/// The four Modbus functions the drivers rely on.
#[async_trait]
pub trait RegisterBus: Send {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DeviceError>;

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, DeviceError>;

    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, DeviceError>;

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), DeviceError>;

    /// Close the underlying transport.
    async fn disconnect(&mut self) -> Result<(), DeviceError>;
}

/// Opens sessions to devices.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn RegisterBus>, DeviceError>;
}

/// Modbus TCP transport backed by `tokio-modbus`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn RegisterBus>, DeviceError> {
        let addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| DeviceError::InvalidAddress(format!("{}: {}", endpoint.host, e)))?
            .next()
            .ok_or_else(|| DeviceError::InvalidAddress(endpoint.host.clone()))?;

        let ctx = tcp::connect_slave(addr, Slave(endpoint.unit_id))
            .await
            .map_err(|e| DeviceError::Connect(e.to_string()))?;

        Ok(Box::new(TcpBus { ctx }))
    }
}

struct TcpBus {
    ctx: Context,
}

#[async_trait]
impl RegisterBus for TcpBus {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DeviceError> {
        self.ctx
            .read_holding_registers(address, count)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?
            .map_err(|e| DeviceError::Exception(format!("{:?}", e)))
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, DeviceError> {
        self.ctx
            .read_discrete_inputs(address, count)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?
            .map_err(|e| DeviceError::Exception(format!("{:?}", e)))
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, DeviceError> {
        self.ctx
            .read_coils(address, count)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?
            .map_err(|e| DeviceError::Exception(format!("{:?}", e)))
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), DeviceError> {
        self.ctx
            .write_single_coil(address, value)
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))?
            .map_err(|e| DeviceError::Exception(format!("{:?}", e)))
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.ctx
            .disconnect()
            .await
            .map_err(|e| DeviceError::Transport(e.to_string()))
    }
}

#[derive(Default)]
struct Link {
    bus: Option<Box<dyn RegisterBus>>,
    /// Opened through `connect()`: stays open when a scope ends.
    pinned: bool,
}

/// One device's session, its state and its access lock.
pub struct DeviceConnection {
    name: String,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    timeout: Duration,
    link: Mutex<Link>,
    state: RwLock<ConnectionState>,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceConnection {
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            connector,
            timeout,
            link: Mutex::new(Link::default()),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Connection over Modbus TCP.
    pub fn tcp(name: impl Into<String>, endpoint: Endpoint, timeout: Duration) -> Self {
        Self::new(name, endpoint, Arc::new(TcpConnector), timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Failed)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut s) = self.state.write() {
            *s = state;
        }
    }

    /// Bookkeeping once a scoped session is closed.
    fn ended(&self) {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
        }
        debug!(device = %self.name, "Scoped session released");
    }

    /// Open the session and keep it open until [`disconnect`](Self::disconnect).
    ///
    /// Succeeds immediately when the session is already open.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let mut link = self.link.lock().await;
        self.open(&mut link).await?;
        link.pinned = true;
        Ok(())
    }

    /// Close the session. Idempotent.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        link.pinned = false;
        if self.close(&mut link).await {
            info!(device = %self.name, "Disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Open a scoped session, connecting first if needed.
    ///
    /// The returned link holds the device lock. Ending the scope closes the
    /// session, through [`DeviceLink::release`] or on drop, unless it was
    /// opened with [`connect`](Self::connect).
    pub async fn acquire(&self) -> Result<DeviceLink<'_>, DeviceError> {
        let mut link = self.link.lock().await;
        self.open(&mut link).await?;
        Ok(DeviceLink {
            conn: self,
            link,
            scoped: true,
            in_flight: false,
        })
    }

    /// Take exclusive access to the device for a sequence of operations.
    pub async fn lock(&self) -> DeviceLink<'_> {
        DeviceLink {
            conn: self,
            link: self.link.lock().await,
            scoped: false,
            in_flight: false,
        }
    }

    async fn open(&self, link: &mut Link) -> Result<(), DeviceError> {
        if link.bus.is_some() {
            return Ok(());
        }

        let attempt = self.connector.connect(&self.endpoint);
        match with_timeout(self.timeout, "connect", attempt).await {
            Ok(bus) => {
                link.bus = Some(bus);
                self.set_state(ConnectionState::Connected);
                info!(device = %self.name, endpoint = %self.endpoint, "Connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                warn!(device = %self.name, endpoint = %self.endpoint, error = %e, "Connection failed");
                Err(e)
            }
        }
    }

    /// Returns whether a session was actually open.
    async fn close(&self, link: &mut Link) -> bool {
        let Some(mut bus) = link.bus.take() else {
            return false;
        };
        if let Err(e) = with_timeout(self.timeout, "disconnect", bus.disconnect()).await {
            debug!(device = %self.name, error = %e, "Error while closing session");
        }
        true
    }
}

/// Exclusive access to a device for the lifetime of the guard.
///
/// Every call short-circuits with [`DeviceError::NotConnected`] when there is
/// no session; transport errors and timeouts drop the session.
pub struct DeviceLink<'a> {
    conn: &'a DeviceConnection,
    link: MutexGuard<'a, Link>,
    /// Handed out by `acquire()`: owns the session unless it is pinned.
    scoped: bool,
    /// A call was issued and has not settled yet.
    in_flight: bool,
}

impl DeviceLink<'_> {
    pub fn is_connected(&self) -> bool {
        self.link.bus.is_some()
    }

    /// End the scope, closing an unpinned session gracefully.
    pub async fn release(mut self) {
        if !self.scoped || self.link.pinned {
            return;
        }
        if self.conn.close(&mut self.link).await {
            self.conn.ended();
        }
    }

    pub async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DeviceError> {
        let timeout = self.conn.timeout;
        let bus = self.bus()?;
        let result = with_timeout(
            timeout,
            "read_holding_registers",
            bus.read_holding_registers(address, count),
        )
        .await;
        self.settle(result)
    }

    pub async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, DeviceError> {
        let timeout = self.conn.timeout;
        let bus = self.bus()?;
        let result = with_timeout(
            timeout,
            "read_discrete_inputs",
            bus.read_discrete_inputs(address, count),
        )
        .await;
        self.settle(result)
    }

    pub async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, DeviceError> {
        let timeout = self.conn.timeout;
        let bus = self.bus()?;
        let result = with_timeout(timeout, "read_coils", bus.read_coils(address, count)).await;
        self.settle(result)
    }

    pub async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), DeviceError> {
        let timeout = self.conn.timeout;
        let bus = self.bus()?;
        let result = with_timeout(
            timeout,
            "write_single_coil",
            bus.write_single_coil(address, value),
        )
        .await;
        self.settle(result)
    }

    fn bus(&mut self) -> Result<&mut Box<dyn RegisterBus>, DeviceError> {
        if self.link.bus.is_none() {
            return Err(DeviceError::NotConnected);
        }
        self.in_flight = true;
        self.link.bus.as_mut().ok_or(DeviceError::NotConnected)
    }

    fn settle<T>(&mut self, result: Result<T, DeviceError>) -> Result<T, DeviceError> {
        self.in_flight = false;
        if let Err(e) = &result {
            if e.is_transport() {
                self.link.bus = None;
                self.conn.set_state(ConnectionState::Failed);
                warn!(device = %self.conn.name, error = %e, "Session dropped after I/O failure");
            }
        }
        result
    }
}

impl Drop for DeviceLink<'_> {
    fn drop(&mut self) {
        // A request abandoned mid-call leaves the stream in an unknown state.
        if self.in_flight && self.link.bus.take().is_some() {
            self.conn.set_state(ConnectionState::Failed);
            warn!(device = %self.conn.name, "Session dropped after an interrupted call");
        }
        if self.scoped && !self.link.pinned && self.link.bus.take().is_some() {
            self.conn.ended();
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: &'static str,
    future: impl Future<Output = Result<T, DeviceError>>,
) -> Result<T, DeviceError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let device = SimDevice::new();
        let conn = device.connection("plc");

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.connect().await.unwrap();
        assert!(conn.is_connected());

        // Already open: no second handshake
        conn.connect().await.unwrap();
        assert_eq!(device.with(|r| r.connects), 1);

        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(device.with(|r| r.disconnects), 1);
    }

    #[tokio::test]
    async fn test_unreachable_device_marks_failed() {
        let device = SimDevice::new();
        device.with(|r| r.reachable = false);
        let conn = device.connection("plc");

        let result = conn.connect().await;
        assert!(matches!(result, Err(DeviceError::Connect(_))));
        assert_eq!(conn.state(), ConnectionState::Failed);

        // Retry succeeds once the device is back
        device.with(|r| r.reachable = true);
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_calls_short_circuit_without_session() {
        let device = SimDevice::new();
        let conn = device.connection("plc");

        let mut link = conn.lock().await;
        assert!(!link.is_connected());
        assert_eq!(
            link.read_coils(100, 1).await,
            Err(DeviceError::NotConnected)
        );
        assert_eq!(
            link.write_single_coil(100, true).await,
            Err(DeviceError::NotConnected)
        );
        drop(link);

        assert!(device.with(|r| r.writes.is_empty()));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_error_drops_session() {
        let device = SimDevice::new();
        device.with(|r| r.fail_address = Some(5));
        let conn = device.connection("plc");
        conn.connect().await.unwrap();

        let mut link = conn.lock().await;
        assert!(matches!(
            link.read_holding_registers(5, 1).await,
            Err(DeviceError::Transport(_))
        ));
        assert!(!link.is_connected());
        assert_eq!(
            link.read_holding_registers(1, 1).await,
            Err(DeviceError::NotConnected)
        );
        drop(link);

        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_hung_call_times_out() {
        let device = SimDevice::new();
        let conn = device.connection("plc");
        conn.connect().await.unwrap();
        device.with(|r| r.hang = true);

        let result = conn.lock().await.read_coils(100, 4).await;
        assert!(matches!(
            result,
            Err(DeviceError::Timeout {
                operation: "read_coils",
                ..
            })
        ));
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_scoped_session_closes_on_release() {
        let device = SimDevice::new();
        let conn = device.connection("plc");

        let mut scope = conn.acquire().await.unwrap();
        assert!(scope.is_connected());
        scope.read_coils(100, 1).await.unwrap();
        scope.release().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(device.with(|r| (r.connects, r.disconnects, r.closed)), (1, 1, 1));

        // The next scope opens a fresh session
        conn.acquire().await.unwrap().release().await;
        assert_eq!(device.with(|r| (r.connects, r.closed)), (2, 2));
    }

    #[tokio::test]
    async fn test_scoped_session_closes_when_dropped() {
        let device = SimDevice::new();
        let conn = device.connection("plc");

        let scope = conn.acquire().await.unwrap();
        drop(scope);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(device.with(|r| (r.connects, r.closed)), (1, 1));
    }

    #[tokio::test]
    async fn test_cancelled_scope_closes_session() {
        let device = SimDevice::new();
        let conn = device.connection("plc");
        device.with(|r| r.hang = true);

        let read = async {
            let mut scope = conn.acquire().await.unwrap();
            scope.read_coils(100, 4).await
        };
        let result = tokio::time::timeout(Duration::from_millis(50), read).await;
        assert!(result.is_err(), "read should still be pending");

        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert_eq!(device.with(|r| (r.connects, r.closed)), (1, 1));
    }

    #[tokio::test]
    async fn test_release_keeps_pinned_session() {
        let device = SimDevice::new();
        let conn = device.connection("plc");
        conn.connect().await.unwrap();

        conn.acquire().await.unwrap().release().await;
        drop(conn.acquire().await.unwrap());

        assert!(conn.is_connected());
        assert_eq!(device.with(|r| (r.disconnects, r.closed)), (0, 0));
    }

    #[tokio::test]
    async fn test_interrupted_call_drops_pinned_session() {
        let device = SimDevice::new();
        let conn = device.connection("plc");
        conn.connect().await.unwrap();
        device.with(|r| r.hang = true);

        let read = async { conn.lock().await.read_coils(100, 4).await };
        assert!(tokio::time::timeout(Duration::from_millis(50), read).await.is_err());

        assert_eq!(conn.state(), ConnectionState::Failed);
        device.with(|r| r.hang = false);
        conn.connect().await.unwrap();
        assert_eq!(device.with(|r| r.connects), 2);
    }

    #[test]
    fn test_transport_classification() {
        assert!(DeviceError::Transport("reset".into()).is_transport());
        assert!(
            DeviceError::Timeout {
                operation: "read_coils",
                timeout_ms: 10
            }
            .is_transport()
        );
        assert!(!DeviceError::Exception("IllegalDataAddress".into()).is_transport());
        assert!(!DeviceError::NotConnected.is_transport());
    }
}
