//! Platform implementation backed by the `bluest` crate

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, ConnectionEvent};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::core::bluetooth::constants::PLATFORM_CHANNEL_CAPACITY;
use crate::core::bluetooth::error::PlatformError;
use crate::core::bluetooth::platform::{
    BlePlatform, CharacteristicHandle, ConnectOptions, PeripheralHandle, PlatformReceiver, RawProperties,
    ServiceHandle,
};
use crate::core::bluetooth::types::{Advertisement, ManufacturerData};

impl From<bluest::Error> for PlatformError {
    fn from(err: bluest::Error) -> Self {
        PlatformError::Backend(err.to_string())
    }
}

type DeviceMap = Arc<Mutex<HashMap<String, bluest::Device>>>;

/// Host Bluetooth stack accessed through `bluest`
pub struct BluestPlatform {
    adapter: Adapter,
    /// Devices seen while scanning, keyed by their platform identifier
    devices: DeviceMap,
}

impl BluestPlatform {
    /// Opens the default adapter and waits until it is powered on
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn remember(devices: &DeviceMap, device: &bluest::Device) -> String {
        let id = device.id().to_string();
        devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), device.clone());
        id
    }

    fn to_advertisement(devices: &DeviceMap, discovered: &AdvertisingDevice) -> Advertisement {
        let id = Self::remember(devices, &discovered.device);
        let adv = &discovered.adv_data;
        let local_name = adv
            .local_name
            .clone()
            .or_else(|| discovered.device.name().ok());
        let service_uuids: Vec<Uuid> = adv.services.iter().copied().collect();
        Advertisement {
            id,
            local_name,
            rssi: discovered.rssi,
            manufacturer_data: adv.manufacturer_data.as_ref().map(|m| ManufacturerData {
                company_id: m.company_id,
                data: m.data.to_vec(),
            }),
            service_uuids: (!service_uuids.is_empty()).then_some(service_uuids),
        }
    }
}

#[async_trait]
impl BlePlatform for BluestPlatform {
    async fn start_scan(&self) -> Result<PlatformReceiver<Advertisement>, PlatformError> {
        let (tx, rx) = mpsc::channel(PLATFORM_CHANNEL_CAPACITY);
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();

        tokio::spawn(async move {
            // Devices already connected to the host do not advertise
            match adapter.connected_devices().await {
                Ok(connected) => {
                    for device in connected {
                        let adv = Advertisement {
                            id: Self::remember(&devices, &device),
                            local_name: device.name().ok(),
                            ..Default::default()
                        };
                        if tx.send(Ok(adv)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Failed to list connected devices: {}", e),
            }

            let mut scan_stream = match adapter.scan(&[]).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = scan_stream.next() => match next {
                        Some(discovered) => {
                            let adv = Self::to_advertisement(&devices, &discovered);
                            if tx.send(Ok(adv)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("bluest scan task finished");
        });

        Ok(rx)
    }

    async fn connect(
        &self,
        device_id: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn PeripheralHandle>, PlatformError> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownDevice(device_id.to_string()))?;

        // Subscribed before connecting so a drop right after the handshake is not missed.
        let link_down = Self::watch_connection(self.adapter.clone(), device.clone()).await?;
        if !device.is_connected().await {
            self.adapter.connect_device(&device).await?;
        }
        // The host stack negotiates the MTU on its own; the request is informational here.
        debug!(
            "Connected to {} (requested mtu {}, timeout {:?})",
            device_id, options.mtu, options.timeout
        );

        Ok(Arc::new(BluestPeripheral {
            id: device_id.to_string(),
            adapter: self.adapter.clone(),
            device,
            link_down,
        }))
    }
}

impl BluestPlatform {
    /// Follows the connection events of `device` and latches the first disconnect.
    /// The task ends once the disconnect is seen or every receiver is gone.
    async fn watch_connection(adapter: Adapter, device: bluest::Device) -> Result<watch::Receiver<bool>, PlatformError> {
        let (tx, rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(PlatformError::from(e)));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) | None => {
                            debug!("Link to {} went down", device.id());
                            tx.send_replace(true);
                            break;
                        }
                        Some(ConnectionEvent::Connected) => {}
                    },
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PlatformError::Backend("connection event task ended early".into())),
        }
    }
}

struct BluestPeripheral {
    id: String,
    adapter: Adapter,
    device: bluest::Device,
    /// Latched to `true` once the platform reports the link down
    link_down: watch::Receiver<bool>,
}

#[async_trait]
impl PeripheralHandle for BluestPeripheral {
    fn device_id(&self) -> &str {
        &self.id
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn services(&self) -> Result<Vec<Arc<dyn ServiceHandle>>, PlatformError> {
        let services = self.device.discover_services().await?;
        Ok(services
            .into_iter()
            .map(|service| Arc::new(BluestService { service }) as Arc<dyn ServiceHandle>)
            .collect())
    }

    async fn cancel_connection(&self) -> Result<(), PlatformError> {
        if self.device.is_connected().await {
            self.adapter.disconnect_device(&self.device).await?;
            info!("Successfully disconnected from {}", self.id);
        } else {
            info!("Device {} not connected", self.id);
        }
        Ok(())
    }

    async fn disconnected(&self) -> Result<(), PlatformError> {
        let mut link_down = self.link_down.clone();
        // A closed channel means the event task is gone, which only happens after the link went down.
        let _ = link_down.wait_for(|down| *down).await;
        Ok(())
    }
}

struct BluestService {
    service: bluest::Service,
}

#[async_trait]
impl ServiceHandle for BluestService {
    fn uuid(&self) -> Uuid {
        self.service.uuid()
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn CharacteristicHandle>>, PlatformError> {
        let characteristics = self.service.discover_characteristics().await?;
        Ok(characteristics
            .into_iter()
            .map(|characteristic| Arc::new(BluestCharacteristic { characteristic }) as Arc<dyn CharacteristicHandle>)
            .collect())
    }
}

struct BluestCharacteristic {
    characteristic: bluest::Characteristic,
}

#[async_trait]
impl CharacteristicHandle for BluestCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid()
    }

    async fn properties(&self) -> Result<RawProperties, PlatformError> {
        let props = self.characteristic.properties().await?;
        Ok(RawProperties {
            read: props.read,
            write: props.write,
            write_without_response: props.write_without_response,
            notify: props.notify,
            indicate: props.indicate,
        })
    }

    async fn read(&self) -> Result<Vec<u8>, PlatformError> {
        Ok(self.characteristic.read().await?)
    }

    async fn write_with_response(&self, value: &[u8]) -> Result<(), PlatformError> {
        Ok(self.characteristic.write(value).await?)
    }

    async fn monitor(&self) -> Result<PlatformReceiver<Vec<u8>>, PlatformError> {
        let (tx, rx) = mpsc::channel(PLATFORM_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let characteristic = self.characteristic.clone();

        tokio::spawn(async move {
            let mut notification_stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(PlatformError::from(e)));
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = notification_stream.next() => match next {
                        Some(result) => {
                            if tx.send(result.map_err(PlatformError::from)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("Monitor on {} released", characteristic.uuid());
        });

        ready_rx
            .await
            .map_err(|_| PlatformError::Backend("monitor task ended before it was ready".into()))??;
        Ok(rx)
    }
}
