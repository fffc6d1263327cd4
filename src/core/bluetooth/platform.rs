//! Platform primitive boundary
//! The core only orchestrates; everything that touches the radio goes
//! through these traits. `bluest_backend` provides the production implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::error::PlatformError;
use crate::core::bluetooth::types::Advertisement;

/// Receiver end of a platform-fed stream. Dropping it releases the underlying
/// platform resource (scan session or value monitor).
pub type PlatformReceiver<T> = mpsc::Receiver<Result<T, PlatformError>>;

/// Options passed to the connection primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// MTU to request during the handshake
    pub mtu: u16,
    /// Upper bound for the handshake
    pub timeout: Duration,
}

/// Capability flags exactly as the platform reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// Gate consulted before any scan is started
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn is_granted(&self) -> bool;
}

/// Permission gate for platforms without runtime permissions
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionGate for AlwaysGranted {
    async fn is_granted(&self) -> bool {
        true
    }
}

/// Adapts a plain predicate into a [`PermissionGate`]
pub struct PermissionFn<F>(pub F);

#[async_trait]
impl<F> PermissionGate for PermissionFn<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn is_granted(&self) -> bool {
        (self.0)()
    }
}

/// Scan and connection primitive of the host Bluetooth stack
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Begins reporting advertisements. The scan stops when the receiver is dropped.
    async fn start_scan(&self) -> Result<PlatformReceiver<Advertisement>, PlatformError>;

    /// Establishes a connection to a previously advertised device.
    async fn connect(
        &self,
        device_id: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn PeripheralHandle>, PlatformError>;
}

/// Handle to one established connection
#[async_trait]
pub trait PeripheralHandle: Send + Sync {
    fn device_id(&self) -> &str;

    async fn is_connected(&self) -> bool;

    /// Walks the peripheral's services
    async fn services(&self) -> Result<Vec<Arc<dyn ServiceHandle>>, PlatformError>;

    /// Requests cancellation of the connection
    async fn cancel_connection(&self) -> Result<(), PlatformError>;

    /// Resolves once the link has dropped
    async fn disconnected(&self) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait ServiceHandle: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn characteristics(&self) -> Result<Vec<Arc<dyn CharacteristicHandle>>, PlatformError>;
}

#[async_trait]
pub trait CharacteristicHandle: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn properties(&self) -> Result<RawProperties, PlatformError>;

    /// Value the platform has cached for this characteristic, if any
    fn cached_value(&self) -> Option<Vec<u8>> {
        None
    }

    async fn read(&self) -> Result<Vec<u8>, PlatformError>;

    async fn write_with_response(&self, value: &[u8]) -> Result<(), PlatformError>;

    /// Installs a value-change monitor. The monitor is released when the receiver is dropped.
    async fn monitor(&self) -> Result<PlatformReceiver<Vec<u8>>, PlatformError>;
}
