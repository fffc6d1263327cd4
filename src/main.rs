//! ble-link command-line entry point

mod cli;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{Level, error, info, warn};
use tokio::time::{Instant, timeout_at};

use ble_link_lib::config::AppConfig;
use ble_link_lib::core::bluetooth::constants::{DEFAULT_SCAN_DURATION_SECS, well_known_name};
use ble_link_lib::core::bluetooth::{BluetoothManager, Device, Topology};
use ble_link_lib::logging;
use ble_link_lib::telemetry::TelemetryBuffer;
use ble_link_lib::utils::parse_hex;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::Debug } else { Level::Info };
    if let Err(e) = logging::init(level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let config = AppConfig::load_config(&cli.config_dir).await?;

    if let Commands::InitConfig = cli.command {
        return config.save_config(&cli.config_dir).await;
    }

    let mut manager = BluetoothManager::with_bluest(&config.bluetooth)
        .await
        .context("Failed to initialize Bluetooth")?;

    let result = match cli.command {
        Commands::Scan { duration } => scan(&mut manager, duration).await,
        Commands::Inspect { device_id, read } => inspect(&mut manager, &device_id, read).await,
        Commands::Monitor {
            device_id,
            service,
            characteristic,
            duration,
        } => {
            monitor(
                &mut manager,
                &device_id,
                service,
                characteristic,
                duration,
                config.bluetooth.telemetry_capacity,
            )
            .await
        }
        Commands::Write {
            device_id,
            service,
            characteristic,
            value,
        } => {
            let value = parse_hex(&value).context("Invalid hex value")?;
            connect_by_id(&mut manager, &device_id).await?;
            manager
                .write_characteristic(service, characteristic, &value)
                .await
                .map_err(anyhow::Error::from)
        }
        Commands::InitConfig => Ok(()),
    };

    manager.disconnect().await;
    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}

async fn scan(manager: &mut BluetoothManager, duration: u64) -> Result<()> {
    let mut devices = manager.start_scan().await?;
    let deadline = Instant::now() + Duration::from_secs(duration);

    while let Ok(Some(device)) = timeout_at(deadline, devices.recv()).await {
        info!("Seen {} ({:?} dBm)", device.display_name(), device.rssi);
    }
    manager.stop_scan().await;

    for device in manager.devices() {
        println!(
            "{}\t{}\t{}\t{}",
            device.id,
            device.display_name(),
            device.address.as_deref().unwrap_or("-"),
            device.rssi.map_or_else(|| "-".to_string(), |rssi| rssi.to_string())
        );
    }
    Ok(())
}

/// Scans until `device_id` is sighted, then returns the merged registry entry
async fn find_device(manager: &mut BluetoothManager, device_id: &str) -> Result<Device> {
    let mut devices = manager.start_scan().await?;
    let deadline = Instant::now() + Duration::from_secs(DEFAULT_SCAN_DURATION_SECS);

    let mut found = None;
    while let Ok(Some(device)) = timeout_at(deadline, devices.recv()).await {
        if device.id == device_id {
            found = Some(device);
            break;
        }
    }
    manager.stop_scan().await;

    found.ok_or_else(|| anyhow!("Device {} not found within {}s", device_id, DEFAULT_SCAN_DURATION_SECS))
}

async fn connect_by_id(manager: &mut BluetoothManager, device_id: &str) -> Result<()> {
    let device = find_device(manager, device_id).await?;
    info!("Connecting to {}...", device.display_name());
    manager.connect(device).await?;
    Ok(())
}

fn print_topology(topology: &Topology) {
    println!("{} ({} characteristics)", topology.device_id, topology.characteristic_count());
    for service in &topology.services {
        println!("  service {} {}", service.uuid, well_known_name(&service.uuid).unwrap_or(""));
        for characteristic in &service.characteristics {
            println!(
                "    characteristic {} [{}] {}",
                characteristic.uuid,
                characteristic.properties,
                well_known_name(&characteristic.uuid).unwrap_or("")
            );
        }
    }
}

async fn inspect(manager: &mut BluetoothManager, device_id: &str, read: bool) -> Result<()> {
    connect_by_id(manager, device_id).await?;
    let topology = manager
        .topology()
        .await
        .ok_or_else(|| anyhow!("Connected but no services were discovered"))?;
    print_topology(&topology);

    if read {
        for service in &topology.services {
            for characteristic in service.characteristics.iter().filter(|c| c.properties.is_readable()) {
                match manager.read_characteristic(service.uuid, characteristic.uuid).await {
                    Ok(value) => println!("{} = {}", characteristic.uuid, hex::encode(value)),
                    Err(e) => warn!("{}", e),
                }
            }
        }
    }
    Ok(())
}

async fn monitor(
    manager: &mut BluetoothManager,
    device_id: &str,
    service: uuid::Uuid,
    characteristic: uuid::Uuid,
    duration: Option<u64>,
    capacity: usize,
) -> Result<()> {
    let mut states = manager.observe_state();
    tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            match &state.error {
                Some(message) => info!("Connection {}: {}", state.phase, message),
                None => info!("Connection {}", state.phase),
            }
        }
    });

    connect_by_id(manager, device_id).await?;

    let buffer = Arc::new(Mutex::new(TelemetryBuffer::new(capacity)));
    let sink = buffer.clone();
    manager
        .subscribe(service, characteristic, move |value| {
            println!("{}", hex::encode(&value));
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(value);
        })
        .await?;

    match duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    let buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    info!("Buffered {} values (capacity {})", buffer.len(), buffer.capacity());
    if let Some(latest) = buffer.latest() {
        info!("Last value {} at {}", hex::encode(&latest.value), latest.timestamp.to_rfc3339());
    }
    Ok(())
}
