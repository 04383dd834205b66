//! Integration tests for the BLE bridge core
//!
//! These tests drive the bridge against the simulated radio and verify:
//! - Single physical connection per device under concurrent connects
//! - Notification channel sharing, fan-out and teardown
//! - Resolution of pending work on disconnect and link loss
//! - Write queueing and failure normalization
//! - Request dispatch through the actor, including event mirroring
//! - Ordering of pipelined requests and cleanup after disconnect

use std::sync::Arc;
use std::time::Duration;

use ble_mux::{
    BleBridge, BridgeConfig, BridgeError, BridgeHandle, CharacteristicUpdate, ConnectionUpdate,
    EventStreams, Subscription,
};
use ble_protocol::{
    BleRequest, BleResponse, BleStatus, CharacteristicKey, ConnectOutcome, ConnectionPriority,
    ConnectionState, DeviceId, FailureKind, OperationResult, RadioError, WriteType,
};
use ble_sim::{characteristic_key, Behavior, VirtualCharacteristicConfig, VirtualPeripheralConfig, VirtualRadio};
use uuid::Uuid;

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    /// Notifying characteristic present on every test peripheral
    pub const HEART_RATE: u128 = 0x2a37;
    /// Writable characteristic present on every test peripheral
    pub const CONTROL_POINT: u128 = 0x2a39;

    pub const WAIT: Duration = Duration::from_secs(2);

    /// Peripheral with one notifying and one writable characteristic
    pub fn sensor(id: &str) -> VirtualPeripheralConfig {
        VirtualPeripheralConfig {
            id: id.to_string(),
            name: Some(format!("Sensor {}", id)),
            characteristics: vec![
                VirtualCharacteristicConfig::notifying(Uuid::from_u128(HEART_RATE)),
                VirtualCharacteristicConfig {
                    notify: false,
                    ..VirtualCharacteristicConfig::notifying(Uuid::from_u128(CONTROL_POINT))
                },
            ],
            ..Default::default()
        }
    }

    pub fn bridge_with_config(
        ids: &[&str],
        config: BridgeConfig,
    ) -> (VirtualRadio, Arc<BleBridge>, EventStreams) {
        let radio = VirtualRadio::with_peripherals(ids.iter().map(|id| sensor(id))).unwrap();
        let (bridge, streams) = BleBridge::new(Arc::new(radio.clone()), config).unwrap();
        (radio, Arc::new(bridge), streams)
    }

    pub fn bridge_with(ids: &[&str]) -> (VirtualRadio, Arc<BleBridge>, EventStreams) {
        bridge_with_config(ids, BridgeConfig::default())
    }

    pub fn heart_rate(id: &str) -> CharacteristicKey {
        characteristic_key(id, HEART_RATE)
    }

    pub fn control_point(id: &str) -> CharacteristicKey {
        characteristic_key(id, CONTROL_POINT)
    }

    pub async fn next_connection(streams: &mut EventStreams) -> ConnectionUpdate {
        tokio::time::timeout(WAIT, streams.connection.recv())
            .await
            .expect("timed out waiting for a connection update")
            .expect("connection stream closed")
    }

    pub async fn next_status(streams: &mut EventStreams) -> Option<BleStatus> {
        tokio::time::timeout(WAIT, streams.status.recv())
            .await
            .expect("timed out waiting for a status update")
    }

    pub async fn next_characteristic(streams: &mut EventStreams) -> CharacteristicUpdate {
        tokio::time::timeout(WAIT, streams.characteristic.recv())
            .await
            .expect("timed out waiting for a characteristic update")
            .expect("characteristic stream closed")
    }

    /// Connect and wait for the `Connected` update
    pub async fn connect(bridge: &BleBridge, streams: &mut EventStreams, id: &str) -> DeviceId {
        let device = DeviceId::from(id);
        bridge.connect(&device, None).unwrap();
        loop {
            let update = next_connection(streams).await;
            assert!(update.failure.is_none(), "unexpected failure: {:?}", update);
            if update.device_id == device && update.state == ConnectionState::Connected {
                return device;
            }
        }
    }

    pub async fn recv_value(sub: &mut Subscription) -> Option<OperationResult<Vec<u8>>> {
        tokio::time::timeout(WAIT, sub.recv())
            .await
            .expect("timed out waiting for a notification")
    }

    /// Poll until a condition holds
    pub async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Collect every connection update already queued
    pub fn drain_connections(streams: &mut EventStreams) -> Vec<ConnectionUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = streams.connection.try_recv() {
            updates.push(update);
        }
        updates
    }
}

use helpers::*;

// ============================================================================
// Connection Registry
// ============================================================================

mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn connect_reports_connecting_then_connected_once() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        let a = DeviceId::from("A");

        let outcome = bridge.connect(&a, Some(Duration::from_secs(5)));
        assert_eq!(outcome, Ok(ConnectOutcome::Started));

        let first = next_connection(&mut streams).await;
        assert_eq!(first, ConnectionUpdate::new(a.clone(), ConnectionState::Connecting));
        let second = next_connection(&mut streams).await;
        assert_eq!(second, ConnectionUpdate::new(a.clone(), ConnectionState::Connected));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(drain_connections(&mut streams).is_empty());
        assert_eq!(bridge.connection_state(&a), ConnectionState::Connected);
        assert_eq!(radio.calls().connects_to(&a), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connects_issue_one_physical_connect() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        let a = DeviceId::from("A");
        radio
            .set_connect_behavior(&a, Behavior::Delay(Duration::from_millis(50)))
            .unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let bridge = bridge.clone();
                let a = a.clone();
                tokio::spawn(async move { bridge.connect(&a, None) })
            })
            .collect();

        let mut started = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(ConnectOutcome::Started) => started += 1,
                Ok(ConnectOutcome::Attached) => {}
                Err(failure) => panic!("connect failed: {}", failure),
            }
        }
        assert_eq!(started, 1);

        assert_eq!(next_connection(&mut streams).await.state, ConnectionState::Connecting);
        assert_eq!(next_connection(&mut streams).await.state, ConnectionState::Connected);
        assert_eq!(radio.calls().connects_to(&a), 1);

        // Connecting again while connected attaches as well
        assert_eq!(bridge.connect(&a, None), Ok(ConnectOutcome::Attached));
        assert_eq!(radio.calls().connects_to(&a), 1);
    }

    #[tokio::test]
    async fn devices_connect_independently() {
        let (radio, bridge, mut streams) = bridge_with(&["A", "B"]);
        let a = DeviceId::from("A");
        radio.set_connect_behavior(&a, Behavior::Hang).unwrap();

        bridge.connect(&a, None).unwrap();
        connect(&bridge, &mut streams, "B").await;

        assert_eq!(bridge.connection_state(&a), ConnectionState::Connecting);
        assert_eq!(
            bridge.connection_state(&DeviceId::from("B")),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn link_loss_fails_device_work() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        let a = connect(&bridge, &mut streams, "A").await;
        let mut sub = bridge.subscribe(&heart_rate("A")).await.unwrap();

        radio.drop_link(&a, RadioError::Disconnected("supervision timeout".into()));

        let update = next_connection(&mut streams).await;
        assert_eq!(update.state, ConnectionState::Disconnected);
        assert_eq!(
            update.failure.map(|f| f.kind),
            Some(FailureKind::ConnectionFailure)
        );

        let failure = recv_value(&mut sub).await.unwrap().unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConnectionFailure);
        assert!(recv_value(&mut sub).await.is_none());

        let read = bridge.read(&heart_rate("A")).await.unwrap_err();
        assert_eq!(read.kind, FailureKind::ConnectionFailure);
    }

    #[tokio::test]
    async fn reconnect_after_disconnect() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        let a = connect(&bridge, &mut streams, "A").await;

        bridge.disconnect(&a).await;
        let updates = drain_connections(&mut streams);
        let states: Vec<_> = updates.iter().map(|u| u.state).collect();
        assert_eq!(
            states,
            vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
        );

        connect(&bridge, &mut streams, "A").await;
        assert_eq!(radio.calls().connects_to(&a), 2);
    }

    #[tokio::test]
    async fn disconnect_all_reaches_every_device() {
        let (radio, bridge, mut streams) = bridge_with(&["A", "B", "C"]);
        for id in ["A", "B", "C"] {
            connect(&bridge, &mut streams, id).await;
        }

        bridge.disconnect_all().await;
        assert!(bridge.registry().tracked_devices().is_empty());
        assert!(!bridge.registry().has_established_connections());
        assert_eq!(radio.calls().disconnects.len(), 3);
    }
}

// ============================================================================
// Notification Multiplexer
// ============================================================================

mod notification_tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_share_one_channel() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        connect(&bridge, &mut streams, "A").await;
        let key = heart_rate("A");

        let mut subs = Vec::new();
        for _ in 0..5 {
            subs.push(bridge.subscribe(&key).await.unwrap());
        }
        assert_eq!(radio.calls().setups_of(&key), 1);
        assert_eq!(bridge.notifications().listener_count(&key).await, 5);

        for sub in &subs {
            bridge.unsubscribe(sub.handle()).await;
        }
        assert_eq!(radio.calls().teardowns_of(&key), 1);
        assert!(!bridge.notifications().is_active(&key).await);

        // A later subscribe opens a fresh channel
        let _again = bridge.subscribe(&key).await.unwrap();
        assert_eq!(radio.calls().setups_of(&key), 2);
    }

    #[tokio::test]
    async fn subscribe_then_immediate_unsubscribe() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        connect(&bridge, &mut streams, "A").await;
        let key = heart_rate("A");

        let sub = bridge.subscribe(&key).await.unwrap();
        bridge.unsubscribe(sub.handle()).await;

        assert_eq!(bridge.notifications().listener_count(&key).await, 0);
        assert_eq!(radio.calls().teardowns_of(&key), 1);
    }

    #[tokio::test]
    async fn value_reaches_only_current_listeners() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        connect(&bridge, &mut streams, "A").await;
        let key = heart_rate("A");

        let mut early = bridge.subscribe(&key).await.unwrap();
        let mut stays = bridge.subscribe(&key).await.unwrap();
        bridge.unsubscribe(early.handle()).await;

        assert!(radio.emit_notification(&key, vec![60]).await);
        assert_eq!(recv_value(&mut stays).await, Some(Ok(vec![60])));
        assert_eq!(recv_value(&mut early).await, None);

        // No replay for late listeners
        let mut late = bridge.subscribe(&key).await.unwrap();
        assert!(late.try_recv().is_none());
        assert!(radio.emit_notification(&key, vec![61]).await);
        assert_eq!(recv_value(&mut late).await, Some(Ok(vec![61])));
        assert_eq!(recv_value(&mut stays).await, Some(Ok(vec![61])));
    }

    #[tokio::test]
    async fn two_listeners_leave_one_by_one() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        connect(&bridge, &mut streams, "A").await;
        let key = heart_rate("A");

        let mut first = bridge.subscribe(&key).await.unwrap();
        let mut second = bridge.subscribe(&key).await.unwrap();

        assert!(radio.emit_notification(&key, b"V".to_vec()).await);
        assert_eq!(recv_value(&mut first).await, Some(Ok(b"V".to_vec())));
        assert_eq!(recv_value(&mut second).await, Some(Ok(b"V".to_vec())));

        bridge.unsubscribe(first.handle()).await;
        assert!(bridge.notifications().is_active(&key).await);

        assert!(radio.emit_notification(&key, b"W".to_vec()).await);
        assert_eq!(recv_value(&mut second).await, Some(Ok(b"W".to_vec())));
        assert_eq!(recv_value(&mut first).await, None);

        bridge.unsubscribe(second.handle()).await;
        assert!(!bridge.notifications().is_active(&key).await);
        assert!(!radio.notification_active(&key));
        assert_eq!(radio.calls().teardowns_of(&key), 1);
    }

    #[tokio::test]
    async fn channels_of_different_keys_are_independent() {
        let (radio, bridge, mut streams) = bridge_with(&["A", "B"]);
        connect(&bridge, &mut streams, "A").await;
        connect(&bridge, &mut streams, "B").await;

        let mut on_a = bridge.subscribe(&heart_rate("A")).await.unwrap();
        let mut on_b = bridge.subscribe(&heart_rate("B")).await.unwrap();

        assert!(
            radio
                .fail_notification(&heart_rate("A"), RadioError::Fault("gatt error".into()))
                .await
        );
        let failure = recv_value(&mut on_a).await.unwrap().unwrap_err();
        assert_eq!(failure.kind, FailureKind::TransportFault);
        assert_eq!(failure.characteristic, Some(heart_rate("A")));

        assert!(radio.emit_notification(&heart_rate("B"), vec![1]).await);
        assert_eq!(recv_value(&mut on_b).await, Some(Ok(vec![1])));
    }

    #[tokio::test]
    async fn subscribe_requires_connection() {
        let (radio, bridge, _streams) = bridge_with(&["A"]);
        let failure = bridge.subscribe(&heart_rate("A")).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConnectionFailure);
        assert_eq!(radio.calls().setups.len(), 0);
    }
}

// ============================================================================
// Operations
// ============================================================================

mod operation_tests {
    use super::*;

    #[tokio::test]
    async fn write_on_unconnected_device_fails_immediately() {
        let (radio, bridge, _streams) = bridge_with(&["A"]);
        let key = control_point("A");

        let failure = bridge
            .write(&key, vec![1], WriteType::WithResponse)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConnectionFailure);
        assert_eq!(failure.device_id, DeviceId::from("A"));
        assert_eq!(failure.characteristic, Some(key));
        assert!(radio.calls().writes.is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_pending_work() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        let a = connect(&bridge, &mut streams, "A").await;
        radio.set_read_behavior(&heart_rate("A"), Behavior::Hang).unwrap();
        radio.set_write_behavior(&control_point("A"), Behavior::Hang).unwrap();

        let mut sub = bridge.subscribe(&heart_rate("A")).await.unwrap();
        let read = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.read(&heart_rate("A")).await })
        };
        let first_write = tokio::spawn(bridge.write(&control_point("A"), vec![1], WriteType::WithResponse));
        let queued_write = tokio::spawn(bridge.write(&control_point("A"), vec![2], WriteType::WithResponse));

        let observer = radio.clone();
        wait_until(move || {
            let calls = observer.calls();
            calls.reads.len() == 1 && calls.writes.len() == 1
        })
        .await;

        bridge.disconnect(&a).await;

        let results = tokio::time::timeout(WAIT, async {
            (
                read.await.unwrap().map(|_| ()),
                first_write.await.unwrap(),
                queued_write.await.unwrap(),
            )
        })
        .await
        .expect("pending work did not resolve");

        for result in [results.0, results.1, results.2] {
            let failure = result.unwrap_err();
            assert_eq!(failure.kind, FailureKind::ConnectionFailure);
            assert!(failure.message.contains("disconnected"));
        }

        let failure = recv_value(&mut sub).await.unwrap().unwrap_err();
        assert!(failure.message.contains("disconnected"));
        // The queued write never reached the radio
        assert_eq!(radio.calls().writes.len(), 1);
    }

    #[tokio::test]
    async fn writes_to_one_characteristic_are_serialized() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        connect(&bridge, &mut streams, "A").await;
        let key = control_point("A");
        radio
            .set_write_behavior(&key, Behavior::Delay(Duration::from_millis(10)))
            .unwrap();

        let pending: Vec<_> = (0u8..5)
            .map(|i| tokio::spawn(bridge.write(&key, vec![i], WriteType::WithResponse)))
            .collect();
        for task in pending {
            assert_eq!(task.await.unwrap(), Ok(()));
        }

        assert_eq!(radio.max_concurrent_writes(&key), 1);
        let order: Vec<Vec<u8>> = radio
            .calls()
            .writes_to(&key)
            .iter()
            .map(|w| w.value.clone())
            .collect();
        assert_eq!(order, (0u8..5).map(|i| vec![i]).collect::<Vec<_>>());
        assert_eq!(radio.characteristic_value(&key), Some(vec![4]));
    }

    #[tokio::test]
    async fn radio_failures_are_normalized() {
        let config = BridgeConfig {
            operation_timeout_ms: 50,
            ..Default::default()
        };
        let (radio, bridge, mut streams) = bridge_with_config(&["A"], config);
        connect(&bridge, &mut streams, "A").await;

        radio
            .set_read_behavior(
                &heart_rate("A"),
                Behavior::Fail(RadioError::Rejected("insufficient authentication".into())),
            )
            .unwrap();
        let rejected = bridge.read(&heart_rate("A")).await.unwrap_err();
        assert_eq!(rejected.kind, FailureKind::OperationRejected);
        assert_eq!(rejected.characteristic, Some(heart_rate("A")));

        radio.set_write_behavior(&control_point("A"), Behavior::Hang).unwrap();
        let timed_out = bridge
            .write(&control_point("A"), vec![1], WriteType::WithoutResponse)
            .await
            .unwrap_err();
        assert_eq!(timed_out.kind, FailureKind::ConnectionFailure);
        assert!(timed_out.message.contains("timed out"));

        // A failure on one characteristic leaves the device usable
        assert_eq!(bridge.connection_state(&DeviceId::from("A")), ConnectionState::Connected);
        radio.set_read_behavior(&heart_rate("A"), Behavior::Respond).unwrap();
        assert!(bridge.read(&heart_rate("A")).await.is_ok());
    }

    #[tokio::test]
    async fn mtu_and_priority_require_connection() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        let a = DeviceId::from("A");

        let failure = bridge.negotiate_mtu(&a, 247).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConnectionFailure);
        assert!(failure.message.contains("not connected"));
        let failure = bridge
            .request_connection_priority(&a, ConnectionPriority::HighPerformance)
            .await
            .unwrap_err();
        assert_eq!(failure.device_id, a);
        assert!(radio.calls().mtu_requests.is_empty());
        assert!(radio.calls().priority_requests.is_empty());

        connect(&bridge, &mut streams, "A").await;
        assert_eq!(bridge.negotiate_mtu(&a, 247).await, Ok(247));
        assert_eq!(
            bridge
                .request_connection_priority(&a, ConnectionPriority::LowPower)
                .await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn unsupported_capabilities_are_reported() {
        let radio = VirtualRadio::with_peripherals([VirtualPeripheralConfig {
            supports_connection_priority: false,
            supports_gatt_cache_clear: false,
            ..sensor("A")
        }])
        .unwrap();
        let (bridge, mut streams) =
            BleBridge::new(Arc::new(radio.clone()), BridgeConfig::default()).unwrap();
        let a = connect(&bridge, &mut streams, "A").await;

        let failure = bridge
            .request_connection_priority(&a, ConnectionPriority::Balanced)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::UnsupportedOperation);

        let failure = bridge.clear_gatt_cache(&a).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn nothing_is_left_running_after_disconnect() {
        let (radio, bridge, mut streams) = bridge_with(&["A"]);
        let metrics = tokio::runtime::Handle::current().metrics();
        let baseline = metrics.num_alive_tasks();

        for _ in 0..3 {
            let device = connect(&bridge, &mut streams, "A").await;
            bridge
                .write(&control_point("A"), vec![1], WriteType::WithResponse)
                .await
                .unwrap();
            let mut sub = bridge.subscribe(&heart_rate("A")).await.unwrap();
            assert!(radio.emit_notification(&heart_rate("A"), vec![2]).await);
            assert_eq!(recv_value(&mut sub).await, Some(Ok(vec![2])));

            bridge.disconnect(&device).await;
            drop(sub);
        }

        wait_until(|| {
            bridge.operations().queued_characteristics() == 0
                && bridge.notifications().tracked_keys() == 0
                && metrics.num_alive_tasks() == baseline
        })
        .await;
    }

}

// ============================================================================
// Request Dispatch
// ============================================================================

mod dispatcher_tests {
    use super::*;

    fn spawn(ids: &[&str]) -> (VirtualRadio, BridgeHandle, EventStreams) {
        let radio = VirtualRadio::with_peripherals(ids.iter().map(|id| sensor(id))).unwrap();
        let (bridge, streams) =
            BleBridge::new(Arc::new(radio.clone()), BridgeConfig::default()).unwrap();
        let (handle, _task) = BridgeHandle::spawn(bridge);
        (radio, handle, streams)
    }

    async fn connect_via(handle: &BridgeHandle, streams: &mut EventStreams, id: &str) {
        let response = handle
            .request(BleRequest::ConnectToDevice {
                device_id: DeviceId::from(id),
                timeout_ms: Some(5_000),
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            BleResponse::Connection {
                device_id: DeviceId::from(id),
                result: Ok(ConnectOutcome::Started),
            }
        );
        loop {
            if next_connection(streams).await.state == ConnectionState::Connected {
                break;
            }
        }
    }

    #[tokio::test]
    async fn status_is_reported() {
        let (radio, handle, _streams) = spawn(&[]);
        assert_eq!(
            handle.request(BleRequest::Status).await.unwrap(),
            BleResponse::Status {
                status: BleStatus::Ready
            }
        );

        radio.set_status(BleStatus::PoweredOff);
        assert_eq!(
            handle.request(BleRequest::Status).await.unwrap(),
            BleResponse::Status {
                status: BleStatus::PoweredOff
            }
        );
    }

    #[tokio::test]
    async fn status_changes_reach_the_status_stream() {
        let (radio, handle, mut streams) = spawn(&[]);

        assert_eq!(next_status(&mut streams).await, Some(BleStatus::Ready));
        radio.set_status(BleStatus::PoweredOff);
        assert_eq!(next_status(&mut streams).await, Some(BleStatus::PoweredOff));
        radio.set_status(BleStatus::Ready);
        assert_eq!(next_status(&mut streams).await, Some(BleStatus::Ready));

        handle.shutdown().await.unwrap();
        wait_until(|| radio.status_watchers() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn notification_start_then_stop_keep_their_order() {
        let (radio, handle, mut streams) = spawn(&["A"]);
        connect_via(&handle, &mut streams, "A").await;
        let key = heart_rate("A");

        for _ in 0..20 {
            let started = handle
                .submit(BleRequest::ReadNotifications {
                    characteristic: key.clone(),
                })
                .await
                .unwrap();
            let stopped = handle
                .submit(BleRequest::StopNotifications {
                    characteristic: key.clone(),
                })
                .await
                .unwrap();

            assert!(!started.await.unwrap().is_failure());
            assert!(!stopped.await.unwrap().is_failure());
            assert!(!radio.notification_active(&key));
        }

        let calls = radio.calls();
        assert_eq!(calls.setups_of(&key), 20);
        assert_eq!(calls.teardowns_of(&key), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scan_start_then_stop_keep_their_order() {
        let (radio, handle, _streams) = spawn(&["A"]);

        for _ in 0..20 {
            let started = handle
                .submit(BleRequest::ScanForDevices {
                    filter: Default::default(),
                })
                .await
                .unwrap();
            let stopped = handle.submit(BleRequest::StopScan).await.unwrap();

            assert_eq!(started.await.unwrap(), BleResponse::done());
            assert_eq!(stopped.await.unwrap(), BleResponse::done());
            assert!(!radio.is_scanning());
        }
        assert_eq!(radio.calls().scans, 20);
    }

    #[tokio::test]
    async fn notifications_are_forwarded_to_the_characteristic_stream() {
        let (radio, handle, mut streams) = spawn(&["A"]);
        connect_via(&handle, &mut streams, "A").await;
        let key = heart_rate("A");

        for _ in 0..2 {
            let response = handle
                .request(BleRequest::ReadNotifications {
                    characteristic: key.clone(),
                })
                .await
                .unwrap();
            assert!(!response.is_failure());
        }
        // Repeated requests keep a single host listener
        assert_eq!(radio.calls().setups_of(&key), 1);

        assert!(radio.emit_notification(&key, vec![80]).await);
        assert_eq!(
            next_characteristic(&mut streams).await,
            CharacteristicUpdate {
                key: key.clone(),
                result: Ok(vec![80]),
            }
        );

        let response = handle
            .request(BleRequest::StopNotifications {
                characteristic: key.clone(),
            })
            .await
            .unwrap();
        assert!(!response.is_failure());
        assert_eq!(radio.calls().teardowns_of(&key), 1);
    }

    #[tokio::test]
    async fn reads_are_answered_and_mirrored() {
        let (radio, handle, mut streams) = spawn(&["A"]);
        connect_via(&handle, &mut streams, "A").await;
        let key = control_point("A");

        let response = handle
            .request(BleRequest::WriteCharacteristic {
                characteristic: key.clone(),
                value: vec![9, 9],
                write_type: WriteType::WithResponse,
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            BleResponse::Written {
                characteristic: key.clone(),
                result: Ok(()),
            }
        );

        let response = handle
            .request(BleRequest::ReadCharacteristic {
                characteristic: key.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            BleResponse::Value {
                characteristic: key.clone(),
                result: Ok(vec![9, 9]),
            }
        );
        assert_eq!(next_characteristic(&mut streams).await.result, Ok(vec![9, 9]));
        assert_eq!(radio.calls().reads.len(), 1);
    }

    #[tokio::test]
    async fn failures_travel_as_responses() {
        let (_radio, handle, _streams) = spawn(&["A"]);

        let response = handle
            .request(BleRequest::NegotiateMtuSize {
                device_id: DeviceId::from("A"),
                mtu_size: 185,
            })
            .await
            .unwrap();
        match response {
            BleResponse::Mtu { result, .. } => {
                assert_eq!(result.unwrap_err().kind, FailureKind::ConnectionFailure)
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // Stopping notifications that were never started is not an error
        let response = handle
            .request(BleRequest::StopNotifications {
                characteristic: heart_rate("A"),
            })
            .await
            .unwrap();
        assert!(!response.is_failure());
    }

    #[tokio::test]
    async fn initialize_tears_down_previous_session() {
        let (radio, handle, mut streams) = spawn(&["A", "B"]);
        connect_via(&handle, &mut streams, "A").await;
        connect_via(&handle, &mut streams, "B").await;

        assert_eq!(
            handle.request(BleRequest::Initialize).await.unwrap(),
            BleResponse::done()
        );
        assert_eq!(radio.calls().disconnects.len(), 2);
        assert!(!radio.is_linked(&DeviceId::from("A")));
        assert!(!radio.is_linked(&DeviceId::from("B")));
    }

    #[tokio::test]
    async fn deinitialize_stops_scan_and_disconnects() {
        let (radio, handle, mut streams) = spawn(&["A"]);
        handle
            .request(BleRequest::ScanForDevices {
                filter: Default::default(),
            })
            .await
            .unwrap();
        connect_via(&handle, &mut streams, "A").await;

        handle.request(BleRequest::Deinitialize).await.unwrap();
        assert!(!radio.is_linked(&DeviceId::from("A")));
        assert_eq!(radio.calls().scans, 1);
    }

    #[tokio::test]
    async fn requests_fail_after_shutdown() {
        let (_radio, handle, _streams) = spawn(&[]);
        handle.shutdown().await.unwrap();

        let mut result = handle.request(BleRequest::Status).await;
        for _ in 0..10 {
            if result.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            result = handle.request(BleRequest::Status).await;
        }
        assert!(matches!(
            result,
            Err(BridgeError::ActorStopped) | Err(BridgeError::ResponseDropped(_))
        ));
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Channel exists iff listeners > 0, and setup/teardown pair up
        #[test]
        fn channel_refcount_matches_listeners(ops in prop::collection::vec(any::<bool>(), 1..40)) {
            runtime().block_on(async {
                let (radio, bridge, mut streams) = bridge_with(&["A"]);
                connect(&bridge, &mut streams, "A").await;
                let key = heart_rate("A");

                let mut held: VecDeque<Subscription> = VecDeque::new();
                let mut opened = 0;
                let mut closed = 0;

                for subscribe in ops {
                    if subscribe {
                        if held.is_empty() {
                            opened += 1;
                        }
                        held.push_back(bridge.subscribe(&key).await.unwrap());
                    } else if let Some(sub) = held.pop_front() {
                        bridge.unsubscribe(sub.handle()).await;
                        if held.is_empty() {
                            closed += 1;
                        }
                    }

                    assert_eq!(bridge.notifications().listener_count(&key).await, held.len());
                    assert_eq!(bridge.notifications().is_active(&key).await, !held.is_empty());
                }

                let calls = radio.calls();
                assert_eq!(calls.setups_of(&key), opened);
                assert_eq!(calls.teardowns_of(&key), closed);
            });
        }

        /// Any number of concurrent connects yields one physical connect
        #[test]
        fn concurrent_connects_are_idempotent(callers in 1usize..24) {
            runtime().block_on(async {
                let (radio, bridge, mut streams) = bridge_with(&["A"]);
                let a = DeviceId::from("A");
                radio
                    .set_connect_behavior(&a, Behavior::Delay(Duration::from_millis(5)))
                    .unwrap();

                let tasks: Vec<_> = (0..callers)
                    .map(|_| {
                        let bridge = bridge.clone();
                        let a = a.clone();
                        tokio::spawn(async move { bridge.connect(&a, None) })
                    })
                    .collect();
                for task in tasks {
                    assert!(task.await.unwrap().is_ok());
                }

                loop {
                    if next_connection(&mut streams).await.state == ConnectionState::Connected {
                        break;
                    }
                }
                assert_eq!(radio.calls().connects_to(&a), 1);
            });
        }
    }
}
