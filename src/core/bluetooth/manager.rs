//! Bluetooth manager
//! This module provides the main interface for bluetooth operations and wires
//! the scanner, the connection supervisor and the notification hub together.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::bluest_backend::BluestPlatform;
use crate::core::bluetooth::connection::{ConnectionSupervisor, lock_registry};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::NotificationHub;
use crate::core::bluetooth::platform::{AlwaysGranted, BlePlatform, PermissionGate};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{ConnectionState, Device, Topology};

/// Manages Bluetooth operations
pub struct BluetoothManager {
    /// Devices seen during the current scan session
    registry: Arc<Mutex<DeviceRegistry>>,
    /// Connection supervisor
    supervisor: ConnectionSupervisor,
    /// Bluetooth scanner
    scanner: BluetoothScanner,
    /// Notification hub
    notification_hub: NotificationHub,
}

impl BluetoothManager {
    /// Creates a new BluetoothManager on top of `platform`
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        permission_gate: Arc<dyn PermissionGate>,
        config: &BluetoothConfig,
    ) -> Self {
        let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
        let supervisor = ConnectionSupervisor::new(platform.clone(), registry.clone(), config.supervisor_config());
        let scanner = BluetoothScanner::new(
            platform,
            registry.clone(),
            permission_gate,
            supervisor.clone(),
            config.advertisement_filter(),
        );

        Self {
            registry,
            supervisor,
            scanner,
            notification_hub: NotificationHub::new(),
        }
    }

    /// Creates a manager backed by the host adapter
    pub async fn with_bluest(config: &BluetoothConfig) -> Result<Self> {
        let platform = BluestPlatform::new().await?;
        Ok(Self::new(Arc::new(platform), Arc::new(AlwaysGranted), config))
    }

    /// Registers the connection state observer, replacing the previous one
    pub fn observe_state(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        self.supervisor.observe()
    }

    pub async fn current_state(&self) -> ConnectionState {
        self.supervisor.current_state().await
    }

    /// Starts a scan session; merged devices are delivered on the returned channel
    pub async fn start_scan(&mut self) -> Result<mpsc::UnboundedReceiver<Device>, BleError> {
        self.scanner.start_scan().await
    }

    pub async fn stop_scan(&mut self) {
        self.scanner.stop_scan().await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Devices discovered in the current scan session, in first-seen order
    pub fn devices(&self) -> Vec<Device> {
        lock_registry(&self.registry).devices()
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        lock_registry(&self.registry).get(device_id).cloned()
    }

    /// Connects to a device with the given ID
    pub async fn connect_device(&mut self, device_id: &str) -> Result<(), BleError> {
        let device = self
            .device(device_id)
            .ok_or_else(|| BleError::ConnectFailed(format!("Device not found with ID: {}", device_id)))?;
        self.connect(device).await
    }

    /// Stops any running scan, then hands `device` to the supervisor
    pub async fn connect(&mut self, device: Device) -> Result<(), BleError> {
        if self.scanner.is_scanning() {
            self.scanner.stop_scan().await;
        }
        self.supervisor.connect(device).await
    }

    /// Releases every subscription, then disconnects from the current device
    pub async fn disconnect(&self) {
        self.notification_hub.unsubscribe_all().await;
        self.supervisor.disconnect().await;
        info!("Disconnected, all subscriptions released.");
    }

    pub async fn is_connected(&self) -> bool {
        self.supervisor.connected_device().await.is_some()
    }

    pub async fn connected_device(&self) -> Option<Device> {
        self.supervisor.connected_device().await
    }

    /// Topology of the current connection
    pub async fn topology(&self) -> Option<Arc<Topology>> {
        self.supervisor.topology().await
    }

    /// Re-discovers services of the current connection
    pub async fn refresh_services(&self) -> Result<Arc<Topology>, BleError> {
        self.supervisor.refresh_topology().await
    }

    pub async fn subscribe<F>(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        listener: F,
    ) -> Result<(), BleError>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let topology = self.supervisor.topology().await;
        self.notification_hub
            .subscribe(topology.as_deref(), service_uuid, characteristic_uuid, listener)
            .await?;

        // The monitor is only valid on the connection it was resolved against.
        let current = self.supervisor.topology().await;
        let unchanged = matches!((&topology, &current), (Some(used), Some(live)) if Arc::ptr_eq(used, live));
        if !unchanged {
            warn!(
                "Connection changed while subscribing to {}/{}, releasing the monitor",
                service_uuid, characteristic_uuid
            );
            self.notification_hub.unsubscribe(service_uuid, characteristic_uuid).await;
            return Err(match current {
                None => BleError::NotConnected,
                Some(_) => BleError::SubscribeFailed("connection changed while subscribing".into()),
            });
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, service_uuid: Uuid, characteristic_uuid: Uuid) -> bool {
        self.notification_hub.unsubscribe(service_uuid, characteristic_uuid).await
    }

    pub async fn active_subscriptions(&self) -> Vec<(Uuid, Uuid)> {
        self.notification_hub.active_subscriptions().await
    }

    pub async fn write_characteristic(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let topology = self.supervisor.topology().await;
        self.notification_hub
            .write_characteristic(topology.as_deref(), service_uuid, characteristic_uuid, value)
            .await
    }

    pub async fn read_characteristic(&self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Result<Vec<u8>, BleError> {
        let topology = self.supervisor.topology().await;
        self.notification_hub
            .read_characteristic(topology.as_deref(), service_uuid, characteristic_uuid)
            .await
    }

    pub async fn clear_error(&self) {
        self.supervisor.clear_error().await
    }
}
