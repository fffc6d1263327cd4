//! Bluetooth connection supervision
//! This module owns the single platform connection, drives the connection
//! state machine and recovers dropped links with bounded exponential backoff.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::core::bluetooth::backoff::BackoffPolicy;
use crate::core::bluetooth::constants::{CONNECT_TIMEOUT_MS, DEFAULT_MTU, MAX_RECONNECT_ATTEMPTS};
use crate::core::bluetooth::discovery::TopologyDiscoverer;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::platform::{BlePlatform, ConnectOptions, PeripheralHandle};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::types::{ConnectionPhase, ConnectionState, Device, Topology};

/// A spawned task that is aborted when its handle is dropped.
///
/// Holding the handle in the state machine guarantees that replacing or
/// clearing the slot cancels the task on every exit path.
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Lets the task run to completion without aborting it on drop.
    /// Used by a task to release its own slot once it has fired.
    pub fn disarm(mut self) {
        self.handle.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Settings for the connection supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub connect: ConnectOptions,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect: ConnectOptions {
                mtu: DEFAULT_MTU,
                timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            },
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOrigin {
    /// Requested by the caller; failures are reported, never retried
    Explicit,
    /// Scheduled after a drop; failures go back through the retry path
    Reconnect,
}

/// Mutable state of the machine. Only touched while holding the lock.
#[derive(Default)]
struct Machine {
    phase: ConnectionPhase,
    scanning: bool,
    /// Device being connected, connected, or reconnected
    device: Option<Device>,
    link: Option<Arc<dyn PeripheralHandle>>,
    topology: Option<Arc<Topology>>,
    attempts: u32,
    /// Bumped by every connect, disconnect and established link; continuations
    /// carrying an older epoch are stale and must not touch the machine.
    epoch: u64,
    last_error: Option<String>,
    pending_reconnect: Option<ScheduledTask>,
    drop_watch: Option<ScheduledTask>,
    current: ConnectionState,
}

impl Machine {
    fn snapshot(&self) -> ConnectionState {
        let connecting = matches!(self.phase, ConnectionPhase::Connecting | ConnectionPhase::Reconnecting);
        let connected = self.phase == ConnectionPhase::Connected;
        ConnectionState {
            phase: self.phase,
            is_scanning: self.scanning,
            is_connecting: connecting,
            is_connected: connected,
            connected_device: if connected { self.device.clone() } else { None },
            error: self.last_error.clone(),
            auto_reconnect: connecting && self.attempts > 0,
            reconnect_attempt: match self.phase {
                ConnectionPhase::Connecting | ConnectionPhase::Reconnecting | ConnectionPhase::Failed => {
                    self.attempts
                }
                _ => 0,
            },
        }
    }

    /// Drops the link, the topology and every scheduled continuation.
    fn release_link(&mut self) -> Option<Arc<dyn PeripheralHandle>> {
        self.pending_reconnect = None;
        self.drop_watch = None;
        self.topology = None;
        self.link.take()
    }
}

struct Shared {
    platform: Arc<dyn BlePlatform>,
    registry: Arc<StdMutex<DeviceRegistry>>,
    discoverer: TopologyDiscoverer,
    config: SupervisorConfig,
    machine: Mutex<Machine>,
    observer: StdMutex<Option<mpsc::UnboundedSender<ConnectionState>>>,
}

/// Owns at most one connection and drives the connection state machine
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

pub(crate) fn lock_registry(registry: &StdMutex<DeviceRegistry>) -> MutexGuard<'_, DeviceRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionSupervisor {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        registry: Arc<StdMutex<DeviceRegistry>>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                platform,
                registry,
                discoverer: TopologyDiscoverer::new(),
                config,
                machine: Mutex::new(Machine::default()),
                observer: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Registers the single state observer, replacing any previous one.
    /// Snapshots published before this call are not replayed.
    pub fn observe(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .shared
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// The most recently published snapshot
    pub async fn current_state(&self) -> ConnectionState {
        self.shared.machine.lock().await.current.clone()
    }

    pub async fn topology(&self) -> Option<Arc<Topology>> {
        self.shared.machine.lock().await.topology.clone()
    }

    pub async fn connected_device(&self) -> Option<Device> {
        let machine = self.shared.machine.lock().await;
        match machine.phase {
            ConnectionPhase::Connected => machine.device.clone(),
            _ => None,
        }
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.shared.machine.lock().await.attempts
    }

    /// Connects to `device`, discovers its topology and publishes `connected`.
    ///
    /// Fails with `AlreadyConnecting` while another attempt is in flight.
    /// A failure is published and returned but never retried automatically.
    /// The attempt keeps running if the returned future is dropped.
    pub async fn connect(&self, device: Device) -> Result<(), BleError> {
        let (epoch, stale_link) = {
            let mut machine = self.shared.machine.lock().await;
            if machine.phase == ConnectionPhase::Connecting {
                let in_flight = machine
                    .device
                    .as_ref()
                    .map_or_else(String::new, |d| d.id.clone());
                warn!("Rejecting connect to {}: attempt to {} in flight", device.id, in_flight);
                return Err(BleError::AlreadyConnecting { in_flight });
            }
            if machine.phase == ConnectionPhase::Connected
                && machine.device.as_ref().is_some_and(|d| d.id == device.id)
            {
                info!("Device {} already connected.", device.id);
                return Ok(());
            }

            let stale_link = machine.release_link();
            if let Some(previous) = machine.device.take() {
                lock_registry(&self.shared.registry).mark_disconnected(&previous.id);
            }
            machine.attempts = 0;
            machine.epoch += 1;
            self.shared.enter_connecting(&mut machine, &device);
            (machine.epoch, stale_link)
        };

        // Detached: dropping this future must not leave the machine in `Connecting`.
        let shared = Arc::clone(&self.shared);
        let attempt = tokio::spawn(async move {
            if let Some(link) = stale_link {
                cancel_best_effort(link).await;
            }
            shared.run_attempt(device, epoch, AttemptOrigin::Explicit).await
        });

        match attempt.await {
            Ok(result) => result,
            Err(e) => Err(BleError::ConnectFailed(format!("connection task failed: {}", e))),
        }
    }

    /// Tears down the connection and any pending reconnect, then publishes `idle`.
    pub async fn disconnect(&self) {
        let link = {
            let mut machine = self.shared.machine.lock().await;
            let link = machine.release_link();
            machine.attempts = self.shared.config.max_reconnect_attempts;
            machine.epoch += 1;
            if let Some(device) = machine.device.take() {
                info!("Disconnecting from device {}", device.id);
                lock_registry(&self.shared.registry).mark_disconnected(&device.id);
            }
            machine.phase = ConnectionPhase::Idle;
            machine.last_error = None;
            self.shared.publish(&mut machine);
            link
        };

        if let Some(link) = link {
            cancel_best_effort(link).await;
        }
    }

    /// Re-runs discovery on the live connection and replaces the snapshot.
    pub async fn refresh_topology(&self) -> Result<Arc<Topology>, BleError> {
        let (link, epoch) = {
            let machine = self.shared.machine.lock().await;
            (machine.link.clone(), machine.epoch)
        };
        let topology = Arc::new(self.shared.discoverer.discover(link.as_ref()).await?);

        let mut machine = self.shared.machine.lock().await;
        if machine.epoch != epoch {
            return Err(BleError::DiscoveryFailed("connection changed during discovery".into()));
        }
        machine.topology = Some(Arc::clone(&topology));
        Ok(topology)
    }

    /// Records that a scan session started
    pub async fn scan_started(&self) {
        let mut machine = self.shared.machine.lock().await;
        machine.scanning = true;
        machine.last_error = None;
        if machine.phase == ConnectionPhase::Idle {
            machine.phase = ConnectionPhase::Scanning;
        }
        self.shared.publish(&mut machine);
    }

    /// Records that the scan session ended, optionally because of an error
    pub async fn scan_stopped(&self, error: Option<String>) {
        let mut machine = self.shared.machine.lock().await;
        if !machine.scanning && error.is_none() {
            return;
        }
        machine.scanning = false;
        if machine.phase == ConnectionPhase::Scanning {
            machine.phase = ConnectionPhase::Idle;
        }
        if error.is_some() {
            machine.last_error = error;
        }
        self.shared.publish(&mut machine);
    }

    /// Publishes the current snapshot with the error removed
    pub async fn clear_error(&self) {
        let mut machine = self.shared.machine.lock().await;
        if machine.last_error.take().is_some() {
            self.shared.publish(&mut machine);
        }
    }

    /// Records a consumer-facing failure that did not change the phase
    pub async fn report_error(&self, error: &BleError) {
        let mut machine = self.shared.machine.lock().await;
        machine.last_error = Some(error.to_string());
        self.shared.publish(&mut machine);
    }
}

impl Shared {
    /// Publishes the snapshot of `machine`. Callers hold the machine lock,
    /// which keeps publications in transition order.
    fn publish(&self, machine: &mut Machine) {
        let state = machine.snapshot();
        debug!("Connection state -> {} ({:?})", state.phase, state.error);
        machine.current = state.clone();
        let mut observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = observer.as_ref() {
            if tx.send(state).is_err() {
                debug!("State observer dropped");
                *observer = None;
            }
        }
    }

    fn enter_connecting(&self, machine: &mut Machine, device: &Device) {
        machine.phase = ConnectionPhase::Connecting;
        machine.scanning = false;
        machine.device = Some(device.clone());
        machine.last_error = None;
        self.publish(machine);
    }

    /// Connects and discovers. Runs without holding the machine lock.
    async fn establish(
        &self,
        device: &Device,
    ) -> Result<(Arc<dyn PeripheralHandle>, Topology), BleError> {
        let options = self.config.connect;
        info!(
            "Initiating connection to {} (mtu {}, timeout {:?})...",
            device.id, options.mtu, options.timeout
        );
        let link = match timeout(options.timeout, self.platform.connect(&device.id, &options)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(BleError::ConnectFailed(e.to_string())),
            Err(_) => {
                return Err(BleError::ConnectFailed(format!(
                    "timed out after {} ms",
                    options.timeout.as_millis()
                )));
            }
        };

        info!("Connection successful, discovering services...");
        match self.discoverer.discover(Some(&link)).await {
            Ok(topology) => Ok((link, topology)),
            Err(e) => {
                cancel_best_effort(link).await;
                Err(e)
            }
        }
    }

    /// One connection attempt. Boxed because the retry path schedules it again.
    fn run_attempt(
        self: Arc<Self>,
        device: Device,
        epoch: u64,
        origin: AttemptOrigin,
    ) -> BoxFuture<'static, Result<(), BleError>> {
        async move {
            let outcome = self.establish(&device).await;

            let mut machine = self.machine.lock().await;
            if machine.epoch != epoch {
                drop(machine);
                debug!("Discarding stale connection attempt to {}", device.id);
                if let Ok((link, _)) = outcome {
                    cancel_best_effort(link).await;
                }
                return Err(BleError::ConnectFailed("connection attempt was cancelled".into()));
            }

            match outcome {
                Ok((link, topology)) => {
                    let mut connected = device;
                    connected.is_connected = true;
                    {
                        let mut registry = lock_registry(&self.registry);
                        registry.upsert(connected.clone());
                        registry.mark_connected(&connected.id);
                    }

                    machine.attempts = 0;
                    machine.epoch += 1;
                    machine.pending_reconnect = None;
                    machine.drop_watch = Some(self.watch_for_drop(Arc::clone(&link), machine.epoch));
                    machine.link = Some(link);
                    machine.topology = Some(Arc::new(topology));
                    machine.phase = ConnectionPhase::Connected;
                    machine.device = Some(connected.clone());
                    machine.last_error = None;
                    self.publish(&mut machine);
                    info!("Device {} connected.", connected.id);
                    Ok(())
                }
                Err(e) => {
                    error!("Connection attempt to {} failed: {}", device.id, e);
                    lock_registry(&self.registry).mark_disconnected(&device.id);
                    machine.release_link();
                    match origin {
                        AttemptOrigin::Explicit => {
                            machine.phase = ConnectionPhase::Idle;
                            machine.device = None;
                            machine.last_error = Some(e.to_string());
                            self.publish(&mut machine);
                        }
                        AttemptOrigin::Reconnect => self.retry_or_give_up(&mut machine, device),
                    }
                    Err(e)
                }
            }
        }
        .boxed()
    }

    /// Schedules the next reconnect, or publishes the terminal state once attempts are exhausted.
    fn retry_or_give_up(self: &Arc<Self>, machine: &mut Machine, device: Device) {
        let max = self.config.max_reconnect_attempts;
        if machine.attempts < max {
            machine.attempts += 1;
            let delay = self.config.backoff.delay(machine.attempts);
            info!(
                "Reconnecting to {} in {} ms (attempt {}/{})",
                device.id,
                delay.as_millis(),
                machine.attempts,
                max
            );
            machine.phase = ConnectionPhase::Reconnecting;
            machine.last_error = Some(format!(
                "Attempting to reconnect ({}/{})",
                machine.attempts, max
            ));
            machine.pending_reconnect = Some(self.schedule_reconnect(device.clone(), machine.epoch, delay));
            machine.device = Some(device);
            self.publish(machine);
        } else {
            warn!("Giving up on {} after {} reconnection attempts", device.id, max);
            machine.pending_reconnect = None;
            machine.phase = ConnectionPhase::Failed;
            machine.device = None;
            machine.last_error = Some(BleError::MaxReconnectAttemptsReached.to_string());
            self.publish(machine);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, device: Device, epoch: u64, delay: Duration) -> ScheduledTask {
        let shared = Arc::clone(self);
        ScheduledTask::spawn(async move {
            sleep(delay).await;
            {
                let mut machine = shared.machine.lock().await;
                if machine.epoch != epoch || machine.phase != ConnectionPhase::Reconnecting {
                    return;
                }
                if let Some(task) = machine.pending_reconnect.take() {
                    task.disarm();
                }
                shared.enter_connecting(&mut machine, &device);
            }
            if let Err(e) = shared.run_attempt(device, epoch, AttemptOrigin::Reconnect).await {
                debug!("Reconnect attempt ended with: {}", e);
            }
        })
    }

    fn watch_for_drop(self: &Arc<Self>, link: Arc<dyn PeripheralHandle>, epoch: u64) -> ScheduledTask {
        let shared = Arc::clone(self);
        ScheduledTask::spawn(async move {
            if let Err(e) = link.disconnected().await {
                warn!("Disconnect notification for {} failed: {}", link.device_id(), e);
                return;
            }
            shared.handle_drop(epoch).await;
        })
    }

    /// Invoked when the platform reports that an established link dropped.
    async fn handle_drop(self: Arc<Self>, epoch: u64) {
        let mut machine = self.machine.lock().await;
        if machine.epoch != epoch || machine.phase != ConnectionPhase::Connected {
            debug!("Ignoring stale disconnect notification");
            return;
        }
        if let Some(task) = machine.drop_watch.take() {
            task.disarm();
        }
        let Some(mut device) = machine.device.clone() else {
            return;
        };
        warn!("Device {} disconnected unexpectedly", device.id);

        machine.link = None;
        machine.topology = None;
        device.is_connected = false;
        lock_registry(&self.registry).mark_disconnected(&device.id);
        self.retry_or_give_up(&mut machine, device);
    }
}

async fn cancel_best_effort(link: Arc<dyn PeripheralHandle>) {
    if let Err(e) = link.cancel_connection().await {
        warn!("Error during disconnect of {}: {}", link.device_id(), e);
    }
}
