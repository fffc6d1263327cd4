//! Constants used throughout the application
//! This module contains the reference values for connection and retry policy,
//! plus the standard UUIDs we know how to name.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_GENERIC_ATTRIBUTE_SERVICE: Uuid = Uuid::from_u128(0x00001801_0000_1000_8000_00805f9b34fb);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const UUID_ENVIRONMENTAL_SENSING_SERVICE: Uuid = Uuid::from_u128(0x0000181a_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
pub const UUID_MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const UUID_MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const UUID_TEMPERATURE: Uuid = Uuid::from_u128(0x00002a6e_0000_1000_8000_00805f9b34fb);
pub const UUID_HUMIDITY: Uuid = Uuid::from_u128(0x00002a6f_0000_1000_8000_00805f9b34fb);
pub const UUID_PRESSURE: Uuid = Uuid::from_u128(0x00002a6d_0000_1000_8000_00805f9b34fb);

/// MTU requested during the connection handshake
pub const DEFAULT_MTU: u16 = 512;

/// Timeout for a single connection attempt in milliseconds
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Maximum number of automatic reconnection attempts after a drop
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base reconnect delay in milliseconds
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Ceiling for the reconnect delay in milliseconds
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Default scan duration for the CLI in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 5;

/// Number of telemetry samples kept by default
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 50;

/// Buffer size of the channels fed by the platform (scan results, notifications)
pub const PLATFORM_CHANNEL_CAPACITY: usize = 64;

/// Returns a human readable name for well-known service and characteristic UUIDs.
pub fn well_known_name(uuid: &Uuid) -> Option<&'static str> {
    let name = match *uuid {
        UUID_GENERIC_ACCESS_SERVICE => "Generic Access",
        UUID_GENERIC_ATTRIBUTE_SERVICE => "Generic Attribute",
        UUID_DEVICE_INFORMATION_SERVICE => "Device Information",
        UUID_HEART_RATE_SERVICE => "Heart Rate",
        UUID_BATTERY_SERVICE => "Battery Service",
        UUID_ENVIRONMENTAL_SENSING_SERVICE => "Environmental Sensing",
        UUID_DEVICE_NAME => "Device Name",
        UUID_BATTERY_LEVEL => "Battery Level",
        UUID_MODEL_NUMBER => "Model Number String",
        UUID_MANUFACTURER_NAME => "Manufacturer Name String",
        UUID_HEART_RATE_MEASUREMENT => "Heart Rate Measurement",
        UUID_TEMPERATURE => "Temperature",
        UUID_HUMIDITY => "Humidity",
        UUID_PRESSURE => "Pressure",
        _ => return None,
    };
    Some(name)
}
