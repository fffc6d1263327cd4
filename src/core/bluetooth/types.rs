//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::core::bluetooth::platform::{CharacteristicHandle, RawProperties};

/// Manufacturer specific payload carried in an advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    /// Bluetooth SIG assigned company identifier
    pub company_id: u16,
    /// Raw payload following the company identifier
    pub data: Vec<u8>,
}

/// A raw advertisement record as reported by the scan primitive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform-specific unique identifier for the device
    pub id: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: Option<ManufacturerData>,
    pub service_uuids: Option<Vec<Uuid>>,
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Platform-specific unique identifier for the device (especially important on macOS)
    pub id: String,
    /// The name of the device, if available
    pub name: Option<String>,
    /// The MAC address, when the platform identifier carries one
    pub address: Option<String>,
    /// The signal strength (RSSI) of the last advertisement
    pub rssi: Option<i16>,
    /// Manufacturer payload of the last advertisement that carried one
    pub manufacturer_data: Option<ManufacturerData>,
    /// Advertised service UUIDs
    pub service_uuids: Option<Vec<Uuid>>,
    /// Whether the device is connected
    pub is_connected: bool,
}

impl Device {
    /// Creates a device that only carries its identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            address: None,
            rssi: None,
            manufacturer_data: None,
            service_uuids: None,
            is_connected: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Name to show to users
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Phase of the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnection attempts are exhausted; left only through an explicit disconnect or connect
    Failed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "disconnected-failed",
        };
        f.write_str(name)
    }
}

/// A full snapshot of the connection, published on every transition
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub is_scanning: bool,
    pub is_connecting: bool,
    pub is_connected: bool,
    /// The connected device, present only while connected
    pub connected_device: Option<Device>,
    /// Last error or reconnect status message
    pub error: Option<String>,
    /// True while an automatic reconnection is in progress
    pub auto_reconnect: bool,
    /// Reconnect attempt counter at the time of the snapshot
    pub reconnect_attempt: u32,
}

impl ConnectionState {
    pub fn idle() -> Self {
        Self::default()
    }
}

/// A single access capability of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    Notify,
    Indicate,
}

impl Capability {
    pub const ALL: [Capability; 4] = [Self::Read, Self::Write, Self::Notify, Self::Indicate];

    const fn bit(self) -> u8 {
        match self {
            Self::Read => 0x01,
            Self::Write => 0x02,
            Self::Notify => 0x04,
            Self::Indicate => 0x08,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Notify => "notify",
            Self::Indicate => "indicate",
        }
    }
}

/// The capability set of a characteristic, stored as a bitset
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_u8(bits: u8) -> Self {
        Self(bits & 0x0f)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.insert(capability);
        self
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.contains(Capability::Read)
    }

    /// True if either write-with-response or write-without-response is supported
    pub fn is_writable(&self) -> bool {
        self.contains(Capability::Write)
    }

    pub fn is_notifiable(&self) -> bool {
        self.contains(Capability::Notify)
    }

    pub fn is_indicatable(&self) -> bool {
        self.contains(Capability::Indicate)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl From<RawProperties> for Capabilities {
    fn from(raw: RawProperties) -> Self {
        let mut caps = Capabilities::empty();
        if raw.read {
            caps.insert(Capability::Read);
        }
        if raw.write || raw.write_without_response {
            caps.insert(Capability::Write);
        }
        if raw.notify {
            caps.insert(Capability::Notify);
        }
        if raw.indicate {
            caps.insert(Capability::Indicate);
        }
        caps
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        let labels: Vec<&str> = self.iter().map(Capability::label).collect();
        f.write_str(&labels.join("|"))
    }
}

#[derive(Serialize)]
struct CapabilityFlags {
    read: bool,
    write: bool,
    notify: bool,
    indicate: bool,
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        CapabilityFlags {
            read: self.is_readable(),
            write: self.is_writable(),
            notify: self.is_notifiable(),
            indicate: self.is_indicatable(),
        }
        .serialize(serializer)
    }
}

/// A discovered characteristic; immutable for the lifetime of a connection
#[derive(Clone, Serialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    /// Last known value at discovery time, if the platform had one cached
    pub value: Option<Vec<u8>>,
    pub properties: Capabilities,
    #[serde(skip)]
    pub(crate) handle: Arc<dyn CharacteristicHandle>,
}

impl Characteristic {
    pub fn handle(&self) -> &Arc<dyn CharacteristicHandle> {
        &self.handle
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.uuid)
            .field("service_uuid", &self.service_uuid)
            .field("value", &self.value)
            .field("properties", &self.properties)
            .finish()
    }
}

/// A discovered service and its characteristics, in platform order
#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

/// Immutable snapshot of a peripheral's services and characteristics
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    pub device_id: String,
    pub services: Vec<Service>,
    pub discovered_at: DateTime<Utc>,
}

impl Topology {
    /// Looks up a characteristic by its service and characteristic UUIDs
    pub fn find(&self, service_uuid: Uuid, characteristic_uuid: Uuid) -> Option<&Characteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == service_uuid)?
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic_uuid)
    }

    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }
}
