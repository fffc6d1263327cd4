//! Bluetooth functionality for ble-link
//! This module handles all bluetooth operations including scanning,
//! connecting, supervising the link and receiving characteristic values.

pub mod backoff;
pub mod bluest_backend;
pub mod connection;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod notification;
pub mod platform;
pub mod registry;
pub mod scanner;
pub mod types;

// Re-export types that should be publicly accessible
pub use backoff::BackoffPolicy;
pub use bluest_backend::BluestPlatform;
pub use connection::{ConnectionSupervisor, SupervisorConfig};
pub use discovery::TopologyDiscoverer;
pub use error::{BleError, PlatformError};
pub use manager::BluetoothManager;
pub use notification::NotificationHub;
pub use platform::{
    AlwaysGranted, BlePlatform, CharacteristicHandle, ConnectOptions, PeripheralHandle, PermissionFn, PermissionGate,
    PlatformReceiver, RawProperties, ServiceHandle,
};
pub use registry::{AdvertisementFilter, DeviceRegistry};
pub use scanner::BluetoothScanner;
pub use types::{
    Advertisement, Capabilities, Capability, Characteristic, ConnectionPhase, ConnectionState, Device,
    ManufacturerData, Service, Topology,
};
