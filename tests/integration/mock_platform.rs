//! In-memory platform used to drive the Bluetooth core deterministically
//!
//! Connection outcomes are scripted per call, drops are injected by hand and
//! every monitor, write and cancellation is recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ble_link_lib::core::bluetooth::{
    Advertisement, BlePlatform, CharacteristicHandle, ConnectOptions, ConnectionPhase, ConnectionState,
    PeripheralHandle, PlatformError, PlatformReceiver, RawProperties, ServiceHandle, SupervisorConfig,
    BackoffPolicy,
};
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::timeout;
use uuid::Uuid;

pub const SENSOR_SERVICE: Uuid = Uuid::from_u128(0x0000181a_0000_1000_8000_00805f9b34fb);
pub const TEMPERATURE_CHAR: Uuid = Uuid::from_u128(0x00002a6e_0000_1000_8000_00805f9b34fb);
pub const CONTROL_CHAR: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);

/// Result of the next `connect` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeed,
    Fail,
    /// Never resolves; the supervisor's timeout has to fire
    Hang,
    /// Connects, then the link drops before discovery has finished
    SucceedThenDrop,
}

/// Supervisor settings with short delays suitable for tests
pub fn fast_config(max_reconnect_attempts: u32) -> SupervisorConfig {
    SupervisorConfig {
        connect: ConnectOptions {
            mtu: 247,
            timeout: Duration::from_millis(300),
        },
        max_reconnect_attempts,
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
    }
}

/// Waits for the next published state
pub async fn next_state(states: &mut mpsc::UnboundedReceiver<ConnectionState>) -> ConnectionState {
    timeout(Duration::from_secs(2), states.recv())
        .await
        .expect("timed out waiting for a state")
        .expect("state channel closed")
}

/// Collects published states up to and including the first one in `phase`
pub async fn states_until(
    states: &mut mpsc::UnboundedReceiver<ConnectionState>,
    phase: ConnectionPhase,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    loop {
        let state = next_state(states).await;
        let done = state.phase == phase;
        seen.push(state);
        if done {
            return seen;
        }
    }
}

/// Polls `condition` until it holds or two seconds have passed
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub struct MockCharacteristic {
    uuid: Uuid,
    properties: RawProperties,
    monitors: Mutex<Vec<mpsc::Sender<Result<Vec<u8>, PlatformError>>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    value: Mutex<Vec<u8>>,
    monitor_requests: AtomicUsize,
    monitor_gate: Notify,
    pub fail_io: AtomicBool,
    pub fail_monitor: AtomicBool,
    /// Makes `monitor` wait for `release_monitor`
    pub hold_monitor: AtomicBool,
}

impl MockCharacteristic {
    fn new(uuid: Uuid, properties: RawProperties) -> Self {
        Self {
            uuid,
            properties,
            monitors: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            value: Mutex::new(vec![0x2a]),
            monitor_requests: AtomicUsize::new(0),
            monitor_gate: Notify::new(),
            fail_io: AtomicBool::new(false),
            fail_monitor: AtomicBool::new(false),
            hold_monitor: AtomicBool::new(false),
        }
    }

    /// Monitors whose receiver is still held by the core
    pub fn active_monitors(&self) -> usize {
        self.monitors.lock().unwrap().iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Delivers a value to every live monitor
    pub fn push(&self, value: &[u8]) {
        for tx in self.monitors.lock().unwrap().iter().filter(|tx| !tx.is_closed()) {
            let _ = tx.try_send(Ok(value.to_vec()));
        }
    }

    pub fn push_error(&self) {
        for tx in self.monitors.lock().unwrap().iter().filter(|tx| !tx.is_closed()) {
            let _ = tx.try_send(Err(PlatformError::Backend("monitor failed".into())));
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn monitor_requests(&self) -> usize {
        self.monitor_requests.load(Ordering::SeqCst)
    }

    pub fn release_monitor(&self) {
        self.monitor_gate.notify_one();
    }
}

#[async_trait]
impl CharacteristicHandle for MockCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn properties(&self) -> Result<RawProperties, PlatformError> {
        Ok(self.properties)
    }

    async fn read(&self) -> Result<Vec<u8>, PlatformError> {
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(PlatformError::Disconnected);
        }
        Ok(self.value.lock().unwrap().clone())
    }

    async fn write_with_response(&self, value: &[u8]) -> Result<(), PlatformError> {
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(PlatformError::Backend("write rejected".into()));
        }
        self.writes.lock().unwrap().push(value.to_vec());
        *self.value.lock().unwrap() = value.to_vec();
        Ok(())
    }

    async fn monitor(&self) -> Result<PlatformReceiver<Vec<u8>>, PlatformError> {
        self.monitor_requests.fetch_add(1, Ordering::SeqCst);
        if self.hold_monitor.load(Ordering::SeqCst) {
            self.monitor_gate.notified().await;
        }
        if self.fail_monitor.load(Ordering::SeqCst) {
            return Err(PlatformError::Backend("notifications unsupported".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        self.monitors.lock().unwrap().push(tx);
        Ok(rx)
    }
}

struct MockService {
    uuid: Uuid,
    characteristics: Vec<Arc<MockCharacteristic>>,
}

#[async_trait]
impl ServiceHandle for MockService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristics(&self) -> Result<Vec<Arc<dyn CharacteristicHandle>>, PlatformError> {
        Ok(self
            .characteristics
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn CharacteristicHandle>)
            .collect())
    }
}

pub struct MockPeripheral {
    id: String,
    connected: AtomicBool,
    /// Latched drop flag of the current link; replaced on every connect
    link_down: Mutex<watch::Sender<bool>>,
    cancels: AtomicUsize,
    services: Vec<Arc<MockService>>,
    pub fail_discovery: AtomicBool,
}

impl MockPeripheral {
    fn new(id: &str) -> Self {
        let temperature = MockCharacteristic::new(
            TEMPERATURE_CHAR,
            RawProperties {
                read: true,
                notify: true,
                ..Default::default()
            },
        );
        let control = MockCharacteristic::new(
            CONTROL_CHAR,
            RawProperties {
                write_without_response: true,
                read: true,
                ..Default::default()
            },
        );
        Self {
            id: id.to_string(),
            connected: AtomicBool::new(false),
            link_down: Mutex::new(watch::channel(false).0),
            cancels: AtomicUsize::new(0),
            services: vec![Arc::new(MockService {
                uuid: SENSOR_SERVICE,
                characteristics: vec![Arc::new(temperature), Arc::new(control)],
            })],
            fail_discovery: AtomicBool::new(false),
        }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Arc<MockCharacteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
            .cloned()
            .expect("unknown mock characteristic")
    }

    fn link_up(&self) {
        self.connected.store(true, Ordering::SeqCst);
        *self.link_down.lock().unwrap() = watch::channel(false).0;
    }

    /// Simulates the peripheral going out of range
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.link_down.lock().unwrap().send_replace(true);
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeripheralHandle for MockPeripheral {
    fn device_id(&self) -> &str {
        &self.id
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn services(&self) -> Result<Vec<Arc<dyn ServiceHandle>>, PlatformError> {
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(PlatformError::Backend("GATT error".into()));
        }
        Ok(self
            .services
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn ServiceHandle>)
            .collect())
    }

    async fn cancel_connection(&self) -> Result<(), PlatformError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnected(&self) -> Result<(), PlatformError> {
        let mut link_down = self.link_down.lock().unwrap().subscribe();
        link_down
            .wait_for(|down| *down)
            .await
            .map(|_| ())
            .map_err(|_| PlatformError::Disconnected)
    }
}

#[derive(Default)]
pub struct MockPlatform {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    peripherals: Mutex<HashMap<String, Arc<MockPeripheral>>>,
    connect_calls: AtomicUsize,
    scan_calls: AtomicUsize,
    scan_tx: Mutex<Option<mpsc::Sender<Result<Advertisement, PlatformError>>>>,
    /// Advertisements replayed at the start of every scan
    advertisements: Mutex<Vec<Advertisement>>,
    pub fail_scan: AtomicBool,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues outcomes for the next `connect` calls; an empty queue succeeds
    pub fn script(&self, outcomes: &[ConnectOutcome]) {
        self.outcomes.lock().unwrap().extend(outcomes.iter().copied());
    }

    pub fn peripheral(&self, id: &str) -> Arc<MockPeripheral> {
        self.peripherals
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(MockPeripheral::new(id)))
            .clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn advertise(&self, adv: Advertisement) {
        self.advertisements.lock().unwrap().push(adv);
    }

    /// Sends an advertisement into the running scan
    pub fn push_advertisement(&self, adv: Advertisement) {
        if let Some(tx) = self.scan_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(Ok(adv));
        }
    }

    pub fn fail_running_scan(&self) {
        if let Some(tx) = self.scan_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(Err(PlatformError::Backend("radio reset".into())));
        }
    }

    pub fn scan_released(&self) -> bool {
        self.scan_tx.lock().unwrap().as_ref().is_none_or(|tx| tx.is_closed())
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn start_scan(&self) -> Result<PlatformReceiver<Advertisement>, PlatformError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_scan.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable);
        }
        let (tx, rx) = mpsc::channel(64);
        for adv in self.advertisements.lock().unwrap().iter() {
            let _ = tx.try_send(Ok(adv.clone()));
        }
        *self.scan_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn connect(
        &self,
        device_id: &str,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn PeripheralHandle>, PlatformError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectOutcome::Succeed);

        match outcome {
            ConnectOutcome::Succeed => {
                let peripheral = self.peripheral(device_id);
                peripheral.link_up();
                Ok(peripheral as Arc<dyn PeripheralHandle>)
            }
            ConnectOutcome::SucceedThenDrop => {
                let peripheral = self.peripheral(device_id);
                peripheral.link_up();
                peripheral.drop_link();
                Ok(peripheral as Arc<dyn PeripheralHandle>)
            }
            ConnectOutcome::Fail => Err(PlatformError::Backend("scripted connect failure".into())),
            ConnectOutcome::Hang => {
                std::future::pending::<()>().await;
                Err(PlatformError::Timeout)
            }
        }
    }
}
