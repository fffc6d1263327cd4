use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::backoff::BackoffPolicy;
use crate::core::bluetooth::connection::SupervisorConfig;
use crate::core::bluetooth::constants::{
    CONNECT_TIMEOUT_MS, DEFAULT_MTU, DEFAULT_TELEMETRY_CAPACITY, MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY_MS,
    RECONNECT_MAX_DELAY_MS,
};
use crate::core::bluetooth::platform::ConnectOptions;
use crate::core::bluetooth::registry::AdvertisementFilter;

/// Connection, retry and scan settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// MTU requested when connecting
    pub mtu: u16,
    /// Upper bound for one connection handshake, in milliseconds
    pub connect_timeout_ms: u64,
    /// How many times a dropped connection is re-established before giving up
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt, in milliseconds
    pub backoff_base_ms: u64,
    /// Longest delay between reconnect attempts, in milliseconds
    pub backoff_ceiling_ms: u64,
    /// Ignore advertisements weaker than this RSSI
    pub min_rssi: Option<i16>,
    /// Only list devices whose name contains this text (case-insensitive)
    pub name_filter: Option<String>,
    /// Number of samples kept by the telemetry buffer
    pub telemetry_capacity: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            mtu: DEFAULT_MTU,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            backoff_base_ms: RECONNECT_BASE_DELAY_MS,
            backoff_ceiling_ms: RECONNECT_MAX_DELAY_MS,
            min_rssi: None,
            name_filter: None,
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
        }
    }
}

impl BluetoothConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, ceiling: Duration) -> Self {
        self.backoff_base_ms = saturating_millis(base);
        self.backoff_ceiling_ms = saturating_millis(ceiling);
        self
    }

    pub fn with_min_rssi(mut self, min_rssi: Option<i16>) -> Self {
        self.min_rssi = min_rssi;
        self
    }

    pub fn with_name_filter(mut self, name_filter: Option<String>) -> Self {
        self.name_filter = name_filter;
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_ceiling_ms),
        )
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect: ConnectOptions {
                mtu: self.mtu,
                timeout: Duration::from_millis(self.connect_timeout_ms),
            },
            max_reconnect_attempts: self.max_reconnect_attempts,
            backoff: self.backoff(),
        }
    }

    pub fn advertisement_filter(&self) -> AdvertisementFilter {
        AdvertisementFilter {
            min_rssi: self.min_rssi,
            name_filter: self.name_filter.clone().filter(|f| !f.is_empty()),
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
