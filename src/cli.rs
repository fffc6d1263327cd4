//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use ble_link_lib::core::bluetooth::constants::DEFAULT_SCAN_DURATION_SECS;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Directory holding ble_link_config.json
    #[arg(short, long, default_value = ".")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan and list advertising devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = DEFAULT_SCAN_DURATION_SECS)]
        duration: u64,
    },
    /// Connect to a device and print its services and characteristics
    Inspect {
        /// Device identifier as printed by `scan`
        device_id: String,
        /// Also read every readable characteristic
        #[arg(short, long)]
        read: bool,
    },
    /// Subscribe to a characteristic and print received values
    Monitor {
        device_id: String,
        service: Uuid,
        characteristic: Uuid,
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Write a hex encoded value with response
    Write {
        device_id: String,
        service: Uuid,
        characteristic: Uuid,
        /// Value as hex, e.g. "01ff"
        value: String,
    },
    /// Write the current configuration (defaults if none exists) to the config directory
    InitConfig,
}
