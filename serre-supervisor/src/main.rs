//! Greenhouse supervisor.
//!
//! Polls the Poseidon and TCW241 units, regulates water and climate, and
//! publishes readings to Zenoh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serre_common::{KeyExprBuilder, Publisher, SupervisorStatus};
use serre_supervisor::config::SupervisorConfig;
use serre_supervisor::connection::{DeviceConnection, Endpoint};
use serre_supervisor::inputs;
use serre_supervisor::poller::{PoseidonPoller, TcwPoller};
use serre_supervisor::poseidon::Poseidon;
use serre_supervisor::sim::SimDevice;
use serre_supervisor::tcw241::Tcw241;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SUPERVISOR_NAME: &str = "serre-supervisor";

/// Greenhouse supervisor for Poseidon and TCW241 units.
#[derive(Parser, Debug)]
#[command(name = "serre-supervisor")]
#[command(about = "Polls greenhouse Modbus units, regulates them and publishes to Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "serre.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Talk to in-memory simulated units instead of the configured hosts.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = SupervisorConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let mut log_config = config.logging.clone();
    if let Some(level) = &args.log_level {
        log_config.level = level.clone();
    }
    serre_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting {}", SUPERVISOR_NAME);
    info!("Loaded configuration from {:?}", args.config);
    if args.simulate {
        warn!("Simulation mode: no field device will be contacted");
    }

    // Connect to Zenoh
    info!("Connecting to Zenoh...");
    let session = serre_common::connect(&config.zenoh)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?;
    let session = Arc::new(session);
    info!("Connected to Zenoh");

    let publisher = Publisher::new(
        session.clone(),
        KeyExprBuilder::new(&config.serre.key_prefix),
        config.serialization,
    );

    let mut tasks = Vec::new();
    let mut poseidon = None;
    let mut tcw = None;

    if let Some(device) = &config.serre.poseidon {
        let connection = device_connection(
            &device.name,
            device.endpoint(),
            device.timeout(),
            args.simulate.then(SimDevice::poseidon),
        );
        let driver = Arc::new(
            Poseidon::new(connection)
                .with_litres_per_pulse(device.litres_per_pulse)
                .with_temperature_scale(device.temperature_scale),
        );

        let (demand_tx, demand_rx) = watch::channel(false);
        let poller = PoseidonPoller::new(driver.clone(), device.poll_interval(), demand_rx)
            .with_publisher(publisher.clone());
        tasks.push(tokio::spawn(poller.run()));

        let key = publisher.keys().demand(&device.name);
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = inputs::listen(&session, &key, demand_tx, inputs::parse_demand).await {
                error!(key_expr = %key, error = %e, "Demand listener stopped");
            }
        }));

        poseidon = Some(driver);
    }

    if let Some(device) = &config.serre.tcw241 {
        let connection = device_connection(
            &device.name,
            device.endpoint(),
            device.timeout(),
            args.simulate.then(SimDevice::tcw241),
        );
        let driver = Arc::new(Tcw241::new(connection).with_roles(device.relays));

        let (setpoint_tx, setpoint_rx) = watch::channel(device.setpoint);
        let poller = TcwPoller::new(driver.clone(), device.poll_interval(), setpoint_rx)
            .with_publisher(publisher.clone());
        tasks.push(tokio::spawn(poller.run()));

        let key = publisher.keys().setpoint(&device.name);
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) =
                inputs::listen(&session, &key, setpoint_tx, inputs::parse_setpoint).await
            {
                error!(key_expr = %key, error = %e, "Setpoint listener stopped");
            }
        }));

        tcw = Some(driver);
    }

    let devices = config.device_names();
    info!("Supervisor running with {} device(s)", devices.len());

    // Publish supervisor status
    let status = SupervisorStatus::running(SUPERVISOR_NAME, env!("CARGO_PKG_VERSION"))
        .with_devices(devices.clone());
    if let Err(e) = status.publish(&publisher).await {
        error!("Failed to publish supervisor status: {}", e);
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Cancel all tasks
    for task in tasks {
        task.abort();
    }

    if let Some(poseidon) = &poseidon {
        poseidon.disconnect().await;
    }
    if let Some(tcw) = &tcw {
        tcw.disconnect().await;
    }

    // Publish offline status
    let status = SupervisorStatus::offline(SUPERVISOR_NAME, env!("CARGO_PKG_VERSION"))
        .with_devices(devices);
    let _ = status.publish(&publisher).await;

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    info!("Supervisor stopped");

    Ok(())
}

/// Modbus TCP connection, or a simulated unit when one is given.
fn device_connection(
    name: &str,
    endpoint: Endpoint,
    timeout: Duration,
    simulated: Option<SimDevice>,
) -> DeviceConnection {
    match simulated {
        Some(device) => DeviceConnection::new(name, endpoint, Arc::new(device), timeout),
        None => DeviceConnection::tcp(name, endpoint, timeout),
    }
}
