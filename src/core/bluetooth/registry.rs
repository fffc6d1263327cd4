//! Registry of devices seen during the current scan session

use std::collections::HashMap;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;

use crate::core::bluetooth::types::{Advertisement, Device};

/// Deduplicating collection of discovered devices keyed by device identifier.
///
/// Repeated sightings are merged into the existing entry so that fields learned
/// earlier survive advertisements that omit them. At most one entry carries the
/// connection flag.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    /// Identifiers in first-seen order
    order: Vec<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry; called when a new scan session starts
    pub fn reset(&mut self) {
        self.devices.clear();
        self.order.clear();
    }

    /// Inserts an unseen device or merges the set fields of `device` over the known entry.
    /// Returns the merged device.
    pub fn upsert(&mut self, device: Device) -> Device {
        match self.devices.get_mut(&device.id) {
            Some(existing) => {
                merge_into(existing, device);
                existing.clone()
            }
            None => {
                debug!("Registering new device {}", device.id);
                self.order.push(device.id.clone());
                self.devices.insert(device.id.clone(), device.clone());
                device
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// All devices in the order they were first seen
    pub fn devices(&self) -> Vec<Device> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The entry currently flagged as connected
    pub fn connected(&self) -> Option<&Device> {
        self.devices.values().find(|d| d.is_connected)
    }

    /// Flags `id` as connected after clearing the flag everywhere else.
    /// Returns false if the device is unknown.
    pub fn mark_connected(&mut self, id: &str) -> bool {
        if !self.devices.contains_key(id) {
            return false;
        }
        for device in self.devices.values_mut() {
            device.is_connected = device.id == id;
        }
        true
    }

    /// Clears the connection flag of `id`. Returns false if the device is unknown.
    pub fn mark_disconnected(&mut self, id: &str) -> bool {
        match self.devices.get_mut(id) {
            Some(device) => {
                device.is_connected = false;
                true
            }
            None => false,
        }
    }
}

fn merge_into(existing: &mut Device, update: Device) {
    if update.name.is_some() {
        existing.name = update.name;
    }
    if update.address.is_some() {
        existing.address = update.address;
    }
    if update.rssi.is_some() {
        existing.rssi = update.rssi;
    }
    if update.manufacturer_data.is_some() {
        existing.manufacturer_data = update.manufacturer_data;
    }
    if update.service_uuids.is_some() {
        existing.service_uuids = update.service_uuids;
    }
}

impl From<Advertisement> for Device {
    fn from(adv: Advertisement) -> Self {
        let address = extract_mac_address(&adv.id);
        Device {
            id: adv.id,
            name: adv.local_name.filter(|n| !n.is_empty()),
            address,
            rssi: adv.rssi,
            manufacturer_data: adv.manufacturer_data,
            service_uuids: adv.service_uuids,
            is_connected: false,
        }
    }
}

/// Pulls the last MAC-looking token out of a platform device identifier
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    static MAC_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = MAC_RE
        .get_or_init(|| Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}([0-9A-Fa-f]{2})").ok())
        .as_ref()?;
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().replace(['_', '-'], ":").to_uppercase())
}

/// Advertisement filter applied before a sighting reaches the registry
#[derive(Debug, Clone, Default)]
pub struct AdvertisementFilter {
    /// Only include devices with this signal strength or stronger
    pub min_rssi: Option<i16>,
    /// Case-insensitive substring the device name must contain
    pub name_filter: Option<String>,
}

impl AdvertisementFilter {
    /// `known_name` is the name already learned for this device, if any
    pub fn accepts(&self, adv: &Advertisement, known_name: Option<&str>) -> bool {
        if let Some(min_rssi) = self.min_rssi {
            match adv.rssi {
                Some(rssi) if rssi >= min_rssi => {}
                _ => return false,
            }
        }
        if let Some(filter) = &self.name_filter {
            let needle = filter.to_lowercase();
            let name = adv.local_name.as_deref().or(known_name);
            return name.is_some_and(|n| n.to_lowercase().contains(&needle));
        }
        true
    }
}
