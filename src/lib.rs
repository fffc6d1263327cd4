//! ble-link library
//! A BLE central that discovers peripherals, keeps a single supervised
//! connection alive and fans out characteristic notifications.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod telemetry;
pub mod utils;
