//! Core functionality for ble-link
//! This module contains the BLE central: discovery, connection supervision and notifications

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::BluetoothManager;
