//! Error types for the Bluetooth core

use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced to consumers of the Bluetooth core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("A connection attempt to {in_flight} is already in progress")]
    AlreadyConnecting { in_flight: String },

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Failed to discover services: {0}")]
    DiscoveryFailed(String),

    #[error("No device connected")]
    NotConnected,

    #[error("Failed to subscribe to characteristic: {0}")]
    SubscribeFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to read characteristic: {0}")]
    ReadFailed(String),

    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("max reconnection attempts reached")]
    MaxReconnectAttemptsReached,

    #[error("Bluetooth permissions were not granted")]
    PermissionDenied,

    #[error("Bluetooth adapter not available")]
    AdapterUnavailable,
}

/// Failures reported by the platform primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Bluetooth adapter not available")]
    Unavailable,

    #[error("Device not found with ID: {0}")]
    UnknownDevice(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Device disconnected")]
    Disconnected,

    #[error("{0}")]
    Backend(String),
}
