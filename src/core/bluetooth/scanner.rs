//! Bluetooth device scanning
//! This module runs scan sessions behind the permission gate and merges
//! accepted advertisements into the device registry.

use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::connection::{ConnectionSupervisor, lock_registry};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::platform::{BlePlatform, PermissionGate, PlatformReceiver};
use crate::core::bluetooth::registry::{AdvertisementFilter, DeviceRegistry};
use crate::core::bluetooth::types::{Advertisement, Device};

/// Drives scan sessions and feeds the device registry
pub struct BluetoothScanner {
    platform: Arc<dyn BlePlatform>,
    registry: Arc<Mutex<DeviceRegistry>>,
    permission_gate: Arc<dyn PermissionGate>,
    supervisor: ConnectionSupervisor,
    filter: AdvertisementFilter,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        registry: Arc<Mutex<DeviceRegistry>>,
        permission_gate: Arc<dyn PermissionGate>,
        supervisor: ConnectionSupervisor,
        filter: AdvertisementFilter,
    ) -> Self {
        Self {
            platform,
            registry,
            permission_gate,
            supervisor,
            filter,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    /// Starts a new scan session.
    ///
    /// The registry is reset, and every merged device is sent on the returned
    /// channel as it is sighted.
    pub async fn start_scan(&mut self) -> Result<mpsc::UnboundedReceiver<Device>, BleError> {
        if !self.permission_gate.is_granted().await {
            error!("Bluetooth permissions not granted, refusing to scan");
            self.supervisor.report_error(&BleError::PermissionDenied).await;
            return Err(BleError::PermissionDenied);
        }

        if self.scan_task_handle.is_some() {
            self.stop_scan().await;
        }
        lock_registry(&self.registry).reset();

        info!("Starting bluetooth scan");
        let scan_stream = match self.platform.start_scan().await {
            Ok(stream) => stream,
            Err(e) => {
                let err = BleError::ScanFailed(e.to_string());
                error!("{}", err);
                self.supervisor.scan_stopped(Some(err.to_string())).await;
                return Err(err);
            }
        };

        self.cancel_token = CancellationToken::new();
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        self.supervisor.scan_started().await;

        let handle = tokio::spawn(Self::internal_scan_task(
            scan_stream,
            self.registry.clone(),
            self.filter.clone(),
            device_tx,
            self.cancel_token.clone(),
            self.supervisor.clone(),
        ));
        self.scan_task_handle = Some(handle);

        info!("Device scan task started.");
        Ok(device_rx)
    }

    /// Stops the current scan session. Safe to call when no scan is running.
    pub async fn stop_scan(&mut self) {
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            info!("Stopping Bluetooth scan.");
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    info!("Scan task was cancelled successfully.");
                } else {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        }
        self.supervisor.scan_stopped(None).await;
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn internal_scan_task(
        mut scan_stream: PlatformReceiver<Advertisement>,
        registry: Arc<Mutex<DeviceRegistry>>,
        filter: AdvertisementFilter,
        device_tx: mpsc::UnboundedSender<Device>,
        cancel_token: CancellationToken,
        supervisor: ConnectionSupervisor,
    ) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                result = scan_stream.recv() => match result {
                    Some(Ok(adv)) => {
                        debug!("Found device - ID: {}, Name: {:?}, RSSI: {:?}", adv.id, adv.local_name, adv.rssi);
                        let merged = {
                            let mut registry = lock_registry(&registry);
                            let known_name = registry.get(&adv.id).and_then(|d| d.name.clone());
                            if !filter.accepts(&adv, known_name.as_deref()) {
                                continue;
                            }
                            registry.upsert(Device::from(adv))
                        };
                        if device_tx.send(merged).is_err() {
                            debug!("Device observer dropped, continuing to populate the registry");
                        }
                    }
                    Some(Err(e)) => {
                        let err = BleError::ScanFailed(e.to_string());
                        error!("{}", err);
                        supervisor.scan_stopped(Some(err.to_string())).await;
                        break;
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        supervisor.scan_stopped(None).await;
                        break;
                    }
                },
            }
        }
    }
}
