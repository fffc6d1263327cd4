use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_link_lib::core::bluetooth::{
    BackoffPolicy, BleError, ConnectionPhase, ConnectionSupervisor, Device, DeviceRegistry,
};

use crate::mock_platform::{ConnectOutcome, MockPlatform, eventually, fast_config, next_state, states_until};

fn supervisor(platform: &Arc<MockPlatform>, max_attempts: u32) -> (ConnectionSupervisor, Arc<Mutex<DeviceRegistry>>) {
    let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
    let supervisor = ConnectionSupervisor::new(platform.clone(), registry.clone(), fast_config(max_attempts));
    (supervisor, registry)
}

fn phases(states: &[ble_link_lib::core::bluetooth::ConnectionState]) -> Vec<ConnectionPhase> {
    states.iter().map(|s| s.phase).collect()
}

#[tokio::test]
async fn connect_publishes_connecting_then_connected() {
    let platform = MockPlatform::new();
    let (supervisor, registry) = supervisor(&platform, 5);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1").with_name("Sensor")).await.unwrap();

    let connecting = next_state(&mut states).await;
    assert_eq!(connecting.phase, ConnectionPhase::Connecting);
    assert!(connecting.is_connecting);
    assert!(!connecting.is_connected);

    let connected = next_state(&mut states).await;
    assert_eq!(connected.phase, ConnectionPhase::Connected);
    assert!(connected.is_connected);
    assert_eq!(connected.connected_device.as_ref().map(|d| d.id.as_str()), Some("A1"));
    assert_eq!(connected.reconnect_attempt, 0);
    assert!(connected.error.is_none());

    let topology = supervisor.topology().await.expect("topology after connect");
    assert_eq!(topology.device_id, "A1");
    assert_eq!(topology.characteristic_count(), 2);
    assert_eq!(registry.lock().unwrap().connected().map(|d| d.id.clone()), Some("A1".to_string()));
}

#[tokio::test]
async fn drop_then_failed_reconnect_then_success() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Succeed, ConnectOutcome::Fail, ConnectOutcome::Succeed]);
    let (supervisor, _registry) = supervisor(&platform, 5);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();
    let mut seen = states_until(&mut states, ConnectionPhase::Connected).await;

    platform.peripheral("A1").drop_link();
    seen.extend(states_until(&mut states, ConnectionPhase::Connected).await);

    assert_eq!(
        phases(&seen),
        vec![
            ConnectionPhase::Connecting,
            ConnectionPhase::Connected,
            ConnectionPhase::Reconnecting,
            ConnectionPhase::Connecting,
            ConnectionPhase::Reconnecting,
            ConnectionPhase::Connecting,
            ConnectionPhase::Connected,
        ]
    );
    assert_eq!(seen[2].reconnect_attempt, 1);
    assert!(seen[2].auto_reconnect);
    assert_eq!(seen[2].error.as_deref(), Some("Attempting to reconnect (1/5)"));
    assert_eq!(seen[4].reconnect_attempt, 2);
    assert_eq!(seen[6].reconnect_attempt, 0);
    assert_eq!(supervisor.reconnect_attempts().await, 0);
    assert_eq!(platform.connect_calls(), 3);
}

#[tokio::test]
async fn exhausted_attempts_publish_one_terminal_state() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Succeed, ConnectOutcome::Fail, ConnectOutcome::Fail]);
    let (supervisor, registry) = supervisor(&platform, 2);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();
    states_until(&mut states, ConnectionPhase::Connected).await;

    platform.peripheral("A1").drop_link();
    let seen = states_until(&mut states, ConnectionPhase::Failed).await;
    assert_eq!(
        phases(&seen),
        vec![
            ConnectionPhase::Reconnecting,
            ConnectionPhase::Connecting,
            ConnectionPhase::Reconnecting,
            ConnectionPhase::Connecting,
            ConnectionPhase::Failed,
        ]
    );

    let failed = seen.last().unwrap();
    assert_eq!(failed.error.as_deref(), Some("max reconnection attempts reached"));
    assert!(!failed.is_connected);
    assert!(!failed.is_connecting);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(states.try_recv().is_err(), "no state after the terminal one");
    assert_eq!(platform.connect_calls(), 3);
    assert!(registry.lock().unwrap().connected().is_none());
    assert!(supervisor.topology().await.is_none());
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    let platform = MockPlatform::new();
    let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
    let mut config = fast_config(5);
    config.backoff = BackoffPolicy::new(Duration::from_millis(200), Duration::from_millis(400));
    let supervisor = ConnectionSupervisor::new(platform.clone(), registry, config);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();
    states_until(&mut states, ConnectionPhase::Connected).await;

    platform.peripheral("A1").drop_link();
    states_until(&mut states, ConnectionPhase::Reconnecting).await;

    supervisor.disconnect().await;
    let idle = next_state(&mut states).await;
    assert_eq!(idle.phase, ConnectionPhase::Idle);
    assert!(idle.connected_device.is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    while let Ok(state) = states.try_recv() {
        assert_ne!(state.phase, ConnectionPhase::Connecting);
    }
    assert_eq!(platform.connect_calls(), 1);
}

#[tokio::test]
async fn initial_failure_is_reported_not_retried() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Fail]);
    let (supervisor, _registry) = supervisor(&platform, 5);
    let mut states = supervisor.observe();

    let result = supervisor.connect(Device::new("A1")).await;
    assert!(matches!(result, Err(BleError::ConnectFailed(_))));

    let seen = states_until(&mut states, ConnectionPhase::Idle).await;
    assert_eq!(phases(&seen), vec![ConnectionPhase::Connecting, ConnectionPhase::Idle]);
    assert!(seen[1].error.is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(platform.connect_calls(), 1);
    assert!(states.try_recv().is_err());
}

#[tokio::test]
async fn connect_timeout_is_a_connect_failure() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Hang]);
    let (supervisor, _registry) = supervisor(&platform, 5);

    let result = supervisor.connect(Device::new("A1")).await;
    match result {
        Err(BleError::ConnectFailed(message)) => assert!(message.contains("timed out")),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(supervisor.current_state().await.phase, ConnectionPhase::Idle);
}

#[tokio::test]
async fn second_connect_while_in_flight_is_rejected() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Hang]);
    let (supervisor, _registry) = supervisor(&platform, 5);
    let mut states = supervisor.observe();

    let first = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.connect(Device::new("A1")).await })
    };
    assert_eq!(next_state(&mut states).await.phase, ConnectionPhase::Connecting);

    let second = supervisor.connect(Device::new("B2")).await;
    assert_eq!(
        second,
        Err(BleError::AlreadyConnecting {
            in_flight: "A1".to_string()
        })
    );

    // The first attempt still resolves through its own timeout.
    assert!(first.await.unwrap().is_err());
}

#[tokio::test]
async fn connecting_elsewhere_moves_the_connected_flag() {
    let platform = MockPlatform::new();
    let (supervisor, registry) = supervisor(&platform, 5);

    supervisor.connect(Device::new("A1")).await.unwrap();
    supervisor.connect(Device::new("B2")).await.unwrap();

    let registry = registry.lock().unwrap();
    assert_eq!(registry.connected().map(|d| d.id.clone()), Some("B2".to_string()));
    assert!(!registry.get("A1").unwrap().is_connected);
    assert_eq!(platform.peripheral("A1").cancel_count(), 1);
}

#[tokio::test]
async fn connecting_twice_to_same_device_is_a_no_op() {
    let platform = MockPlatform::new();
    let (supervisor, _registry) = supervisor(&platform, 5);

    supervisor.connect(Device::new("A1")).await.unwrap();
    supervisor.connect(Device::new("A1")).await.unwrap();
    assert_eq!(platform.connect_calls(), 1);
}

#[tokio::test]
async fn disconnect_releases_link_and_topology() {
    let platform = MockPlatform::new();
    let (supervisor, registry) = supervisor(&platform, 5);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();
    states_until(&mut states, ConnectionPhase::Connected).await;

    supervisor.disconnect().await;
    let idle = next_state(&mut states).await;
    assert_eq!(idle.phase, ConnectionPhase::Idle);
    assert!(!idle.is_connected);
    assert!(supervisor.topology().await.is_none());
    assert!(supervisor.connected_device().await.is_none());
    assert!(registry.lock().unwrap().connected().is_none());
    assert_eq!(platform.peripheral("A1").cancel_count(), 1);
}

#[tokio::test]
async fn discovery_failure_cancels_the_link() {
    let platform = MockPlatform::new();
    let peripheral = platform.peripheral("A1");
    peripheral
        .fail_discovery
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let (supervisor, _registry) = supervisor(&platform, 5);

    let result = supervisor.connect(Device::new("A1")).await;
    assert!(matches!(result, Err(BleError::DiscoveryFailed(_))));
    assert_eq!(peripheral.cancel_count(), 1);
    assert!(supervisor.topology().await.is_none());
}

#[tokio::test]
async fn refresh_replaces_the_topology_snapshot() {
    let platform = MockPlatform::new();
    let (supervisor, _registry) = supervisor(&platform, 5);

    assert!(matches!(
        supervisor.refresh_topology().await,
        Err(BleError::DiscoveryFailed(_))
    ));

    supervisor.connect(Device::new("A1")).await.unwrap();
    let before = supervisor.topology().await.unwrap();
    let after = supervisor.refresh_topology().await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(after.discovered_at >= before.discovered_at);
    assert!(Arc::ptr_eq(&after, &supervisor.topology().await.unwrap()));
}

#[tokio::test]
async fn explicit_connect_after_failure_resets_attempts() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Succeed, ConnectOutcome::Fail]);
    let (supervisor, _registry) = supervisor(&platform, 1);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();
    platform.peripheral("A1").drop_link();
    states_until(&mut states, ConnectionPhase::Failed).await;

    supervisor.connect(Device::new("A1")).await.unwrap();
    let seen = states_until(&mut states, ConnectionPhase::Connected).await;
    assert_eq!(seen[0].phase, ConnectionPhase::Connecting);
    assert_eq!(seen[0].reconnect_attempt, 0);
    assert_eq!(supervisor.reconnect_attempts().await, 0);
}

#[tokio::test]
async fn clear_error_republishes_without_error() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Fail]);
    let (supervisor, _registry) = supervisor(&platform, 5);
    let mut states = supervisor.observe();

    let _ = supervisor.connect(Device::new("A1")).await;
    states_until(&mut states, ConnectionPhase::Idle).await;

    supervisor.clear_error().await;
    let cleared = next_state(&mut states).await;
    assert!(cleared.error.is_none());
    assert!(supervisor.current_state().await.error.is_none());
}

#[tokio::test]
async fn new_observer_replaces_the_old_one() {
    let platform = MockPlatform::new();
    let (supervisor, _registry) = supervisor(&platform, 5);
    let mut first = supervisor.observe();
    let mut second = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();

    assert_eq!(next_state(&mut second).await.phase, ConnectionPhase::Connecting);
    assert!(first.recv().await.is_none());
}

#[tokio::test]
async fn abandoned_connect_still_resolves() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Hang]);
    let (supervisor, _registry) = supervisor(&platform, 5);
    let mut states = supervisor.observe();

    let abandoned = tokio::time::timeout(Duration::from_millis(20), supervisor.connect(Device::new("A1"))).await;
    assert!(abandoned.is_err());

    let seen = states_until(&mut states, ConnectionPhase::Idle).await;
    assert_eq!(phases(&seen), vec![ConnectionPhase::Connecting, ConnectionPhase::Idle]);
    assert!(seen[1].error.as_deref().is_some_and(|e| e.contains("timed out")));

    supervisor.connect(Device::new("B2")).await.unwrap();
    assert_eq!(supervisor.connected_device().await.map(|d| d.id), Some("B2".to_string()));
    assert_eq!(platform.connect_calls(), 2);
}

#[tokio::test]
async fn connect_during_backoff_replaces_the_pending_retry() {
    let platform = MockPlatform::new();
    let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
    let mut config = fast_config(5);
    config.backoff = BackoffPolicy::new(Duration::from_millis(200), Duration::from_millis(400));
    let supervisor = ConnectionSupervisor::new(platform.clone(), registry.clone(), config);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();
    states_until(&mut states, ConnectionPhase::Connected).await;

    platform.peripheral("A1").drop_link();
    states_until(&mut states, ConnectionPhase::Reconnecting).await;

    supervisor.connect(Device::new("B2")).await.unwrap();
    let seen = states_until(&mut states, ConnectionPhase::Connected).await;
    assert_eq!(phases(&seen), vec![ConnectionPhase::Connecting, ConnectionPhase::Connected]);
    assert_eq!(seen[1].connected_device.as_ref().map(|d| d.id.as_str()), Some("B2"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(states.try_recv().is_err(), "the retry for A1 never fires");
    assert_eq!(platform.connect_calls(), 2);
    assert_eq!(registry.lock().unwrap().connected().map(|d| d.id.clone()), Some("B2".to_string()));
}

#[tokio::test]
async fn drop_during_reconnect_attempt_starts_no_second_attempt() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::Succeed, ConnectOutcome::Hang]);
    let (supervisor, _registry) = supervisor(&platform, 1);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();
    states_until(&mut states, ConnectionPhase::Connected).await;

    let peripheral = platform.peripheral("A1");
    peripheral.drop_link();
    let seen = states_until(&mut states, ConnectionPhase::Connecting).await;
    assert_eq!(phases(&seen), vec![ConnectionPhase::Reconnecting, ConnectionPhase::Connecting]);
    assert!(eventually(|| platform.connect_calls() == 2).await);

    // The reconnect attempt hangs until the 300 ms connect timeout
    peripheral.drop_link();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(platform.connect_calls(), 2);
    assert!(states.try_recv().is_err());

    let failed = next_state(&mut states).await;
    assert_eq!(failed.phase, ConnectionPhase::Failed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(states.try_recv().is_err());
    assert_eq!(platform.connect_calls(), 2);
}

#[tokio::test]
async fn drop_before_discovery_finishes_is_not_missed() {
    let platform = MockPlatform::new();
    platform.script(&[ConnectOutcome::SucceedThenDrop]);
    let (supervisor, _registry) = supervisor(&platform, 5);
    let mut states = supervisor.observe();

    supervisor.connect(Device::new("A1")).await.unwrap();
    let mut seen = states_until(&mut states, ConnectionPhase::Connected).await;
    seen.extend(states_until(&mut states, ConnectionPhase::Connected).await);

    assert_eq!(
        phases(&seen),
        vec![
            ConnectionPhase::Connecting,
            ConnectionPhase::Connected,
            ConnectionPhase::Reconnecting,
            ConnectionPhase::Connecting,
            ConnectionPhase::Connected,
        ]
    );
    assert_eq!(platform.connect_calls(), 2);
    assert!(supervisor.topology().await.is_some());
}
