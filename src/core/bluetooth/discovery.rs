//! Service and characteristic discovery
//! Walks a connected peripheral and produces an immutable topology snapshot.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};

use crate::core::bluetooth::constants::well_known_name;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::platform::PeripheralHandle;
use crate::core::bluetooth::types::{Capabilities, Characteristic, Service, Topology};

/// Produces topology snapshots for a connected peripheral
#[derive(Debug, Clone, Copy, Default)]
pub struct TopologyDiscoverer;

impl TopologyDiscoverer {
    pub fn new() -> Self {
        Self
    }

    /// Walks every service and characteristic of `link`.
    ///
    /// Each call produces a fresh snapshot; nothing is merged with earlier passes.
    pub async fn discover(
        &self,
        link: Option<&Arc<dyn PeripheralHandle>>,
    ) -> Result<Topology, BleError> {
        let link = link.ok_or_else(|| BleError::DiscoveryFailed("no connection established".into()))?;
        if !link.is_connected().await {
            return Err(BleError::DiscoveryFailed(format!(
                "device {} is not connected",
                link.device_id()
            )));
        }

        info!("Discovering services of {}...", link.device_id());
        let platform_services = link
            .services()
            .await
            .map_err(|e| BleError::DiscoveryFailed(e.to_string()))?;

        let mut services = Vec::with_capacity(platform_services.len());
        for service in platform_services {
            let service_uuid = service.uuid();
            debug!(
                "Found service: {} ({})",
                service_uuid,
                well_known_name(&service_uuid).unwrap_or("custom")
            );

            let handles = service
                .characteristics()
                .await
                .map_err(|e| BleError::DiscoveryFailed(e.to_string()))?;

            let mut characteristics = Vec::with_capacity(handles.len());
            for handle in handles {
                let raw = handle
                    .properties()
                    .await
                    .map_err(|e| BleError::DiscoveryFailed(e.to_string()))?;
                let properties = Capabilities::from(raw);
                debug!("  characteristic {} [{}]", handle.uuid(), properties);

                characteristics.push(Characteristic {
                    uuid: handle.uuid(),
                    service_uuid,
                    value: handle.cached_value(),
                    properties,
                    handle,
                });
            }

            services.push(Service {
                uuid: service_uuid,
                characteristics,
            });
        }

        let topology = Topology {
            device_id: link.device_id().to_string(),
            services,
            discovered_at: Utc::now(),
        };
        info!(
            "Discovered {} services with {} characteristics",
            topology.services.len(),
            topology.characteristic_count()
        );
        Ok(topology)
    }
}
