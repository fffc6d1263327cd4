//! Notification handling
//! This module installs value-change monitors on characteristics and forwards
//! every received value to the listener registered for that characteristic.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::platform::PlatformReceiver;
use crate::core::bluetooth::types::{Characteristic, Topology};

/// Callback receiving raw characteristic values
pub type ValueListener = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

type SubscriptionKey = (Uuid, Uuid);

/// One installed monitor and the task forwarding its values
struct Subscription {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stops forwarding and waits until the monitor receiver has been dropped
    async fn release(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Notification task finished with an unexpected join error: {:?}", e);
            }
        }
    }
}

/// Owns at most one monitor per (service, characteristic) pair
#[derive(Default)]
pub struct NotificationHub {
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to value changes of a characteristic.
    ///
    /// An existing subscription for the same pair is released before the new
    /// monitor is installed. Monitor errors after this call returns are logged
    /// and end the subscription; they are not retried.
    pub async fn subscribe<F>(
        &self,
        topology: Option<&Topology>,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        listener: F,
    ) -> Result<(), BleError>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let topology = topology.ok_or(BleError::NotConnected)?;
        let handle = Arc::clone(find(topology, service_uuid, characteristic_uuid)?.handle());

        let key = (service_uuid, characteristic_uuid);
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(previous) = subscriptions.remove(&key) {
            info!("Replacing subscription on {}/{}", service_uuid, characteristic_uuid);
            previous.release().await;
        }

        info!("Subscribing to notifications of {}...", characteristic_uuid);
        let monitor = handle
            .monitor()
            .await
            .map_err(|e| BleError::SubscribeFailed(e.to_string()))?;

        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(Self::process_notifications(
            key,
            monitor,
            Arc::new(listener),
            cancel_token.clone(),
        ));
        subscriptions.insert(key, Subscription { cancel_token, task });
        Ok(())
    }

    /// Releases the monitor for a pair. Returns false if there was none.
    pub async fn unsubscribe(&self, service_uuid: Uuid, characteristic_uuid: Uuid) -> bool {
        let previous = self
            .subscriptions
            .lock()
            .await
            .remove(&(service_uuid, characteristic_uuid));
        match previous {
            Some(subscription) => {
                subscription.release().await;
                info!("Unsubscribed from {}/{}", service_uuid, characteristic_uuid);
                true
            }
            None => false,
        }
    }

    /// Releases every monitor
    pub async fn unsubscribe_all(&self) {
        let drained: Vec<_> = self.subscriptions.lock().await.drain().collect();
        for (_, subscription) in drained {
            subscription.release().await;
        }
    }

    /// Pairs whose forwarding task is still running
    pub async fn active_subscriptions(&self) -> Vec<(Uuid, Uuid)> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .filter(|(_, s)| !s.task.is_finished())
            .map(|(key, _)| *key)
            .collect()
    }

    /// Writes `value` with response and waits for the acknowledgement
    pub async fn write_characteristic(
        &self,
        topology: Option<&Topology>,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let topology = topology.ok_or(BleError::NotConnected)?;
        let characteristic = find(topology, service_uuid, characteristic_uuid)?;
        debug!("Writing {} bytes to {}", value.len(), characteristic_uuid);
        characteristic
            .handle()
            .write_with_response(value)
            .await
            .map_err(|e| BleError::WriteFailed(e.to_string()))
    }

    /// Reads the current value of a characteristic
    pub async fn read_characteristic(
        &self,
        topology: Option<&Topology>,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        let topology = topology.ok_or(BleError::NotConnected)?;
        let characteristic = find(topology, service_uuid, characteristic_uuid)?;
        characteristic
            .handle()
            .read()
            .await
            .map_err(|e| BleError::ReadFailed(e.to_string()))
    }

    /// Forwards monitor values to the listener until cancelled or the monitor ends
    async fn process_notifications(
        key: SubscriptionKey,
        mut monitor: PlatformReceiver<Vec<u8>>,
        listener: ValueListener,
        cancel_token: CancellationToken,
    ) {
        let (service_uuid, characteristic_uuid) = key;
        debug!("Listening for notifications on {}/{}", service_uuid, characteristic_uuid);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                received = monitor.recv() => match received {
                    Some(Ok(value)) => {
                        debug!("Received {} bytes from {}", value.len(), characteristic_uuid);
                        listener(value);
                    }
                    Some(Err(e)) => {
                        error!("Error in notification stream of {}: {}", characteristic_uuid, e);
                        break;
                    }
                    None => {
                        warn!("Notification stream of {} closed", characteristic_uuid);
                        break;
                    }
                },
            }
        }
        debug!("Notification stream of {} ended", characteristic_uuid);
    }
}

fn find(topology: &Topology, service_uuid: Uuid, characteristic_uuid: Uuid) -> Result<&Characteristic, BleError> {
    topology
        .find(service_uuid, characteristic_uuid)
        .ok_or(BleError::CharacteristicNotFound {
            service: service_uuid,
            characteristic: characteristic_uuid,
        })
}
