//! Bridge facade
//!
//! [`BleBridge`] wires the registry, the notification multiplexer, the
//! operation handler and the scanner around one radio and one set of event
//! streams. The dispatcher actor drives it; tests can also call it directly.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ble_protocol::{
    BleRadio, BleStatus, CharacteristicKey, ConnectOutcome, ConnectionPriority, ConnectionState,
    DeviceId, OperationResult, ScanFilter, WriteType,
};
use tracing::info;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::events::{event_channels, EventSink, EventStreams};
use crate::notify::{NotificationMultiplexer, Subscription, SubscriptionHandle};
use crate::operations::Operations;
use crate::registry::ConnectionRegistry;
use crate::scan::Scanner;
use crate::status::StatusMonitor;

/// The BLE bridge core
pub struct BleBridge {
    radio: Arc<dyn BleRadio>,
    config: BridgeConfig,
    events: EventSink,
    registry: ConnectionRegistry,
    notifications: Arc<NotificationMultiplexer>,
    operations: Operations,
    scanner: Scanner,
    status: StatusMonitor,
}

impl BleBridge {
    /// Create a bridge and the event streams it emits on
    pub fn new(
        radio: Arc<dyn BleRadio>,
        config: BridgeConfig,
    ) -> Result<(Self, EventStreams), BridgeError> {
        let (events, streams) = event_channels();
        Ok((Self::with_events(radio, config, events)?, streams))
    }

    /// Create a bridge emitting on an existing sink
    pub fn with_events(
        radio: Arc<dyn BleRadio>,
        config: BridgeConfig,
        events: EventSink,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let notifications = Arc::new(NotificationMultiplexer::new(
            radio.clone(),
            config.notification_timeout(),
        ));
        let registry = ConnectionRegistry::new(
            radio.clone(),
            notifications.clone(),
            events.clone(),
            config.connect_timeout(),
            config.operation_timeout(),
        );
        let operations = Operations::new(radio.clone(), registry.clone(), config.operation_timeout());
        let scanner = Scanner::new(radio.clone(), events.clone());
        let status = StatusMonitor::new(radio.clone(), events.clone());

        Ok(Self {
            radio,
            config,
            events,
            registry,
            notifications,
            operations,
            scanner,
            status,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn notifications(&self) -> &NotificationMultiplexer {
        &self.notifications
    }

    pub fn operations(&self) -> &Operations {
        &self.operations
    }

    /// Reset the bridge for a new host session
    ///
    /// Connections left over from a previous session are torn down.
    pub async fn initialize(&self) {
        self.scanner.stop().await;
        if !self.registry.tracked_devices().is_empty() {
            info!("Initialize: tearing down connections from previous session");
            self.registry.disconnect_all().await;
        }
    }

    /// Stop scanning and disconnect every device
    pub async fn deinitialize(&self) {
        self.scanner.stop().await;
        self.registry.disconnect_all().await;
        info!("Bridge deinitialized");
    }

    pub async fn status(&self) -> BleStatus {
        self.radio.status().await
    }

    /// Forward adapter status changes to the status event stream
    pub async fn watch_status(&self) {
        self.status.start().await;
    }

    pub fn unwatch_status(&self) {
        self.status.stop();
    }

    /// Queue a scan start; see [`Scanner::start`]
    pub fn start_scan(&self, filter: ScanFilter) -> impl Future<Output = ()> + Send + 'static {
        self.scanner.start(filter)
    }

    pub fn stop_scan(&self) -> impl Future<Output = ()> + Send + 'static {
        self.scanner.stop()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn connect(
        &self,
        device: &DeviceId,
        timeout: Option<Duration>,
    ) -> OperationResult<ConnectOutcome> {
        self.registry.connect(device, timeout)
    }

    pub async fn disconnect(&self, device: &DeviceId) {
        self.registry.disconnect(device).await;
    }

    pub async fn disconnect_all(&self) {
        self.registry.disconnect_all().await;
    }

    pub fn connection_state(&self, device: &DeviceId) -> ConnectionState {
        self.registry.state(device)
    }

    pub async fn clear_gatt_cache(&self, device: &DeviceId) -> OperationResult<()> {
        self.registry.clear_gatt_cache(device).await
    }

    pub async fn read(&self, key: &CharacteristicKey) -> OperationResult<Vec<u8>> {
        self.operations.read(key).await
    }

    /// Queue a write; see [`Operations::write`]
    pub fn write(
        &self,
        key: &CharacteristicKey,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> impl Future<Output = OperationResult<()>> + Send + 'static {
        self.operations.write(key, value, write_type)
    }

    /// Add a notification listener on a connected device
    pub async fn subscribe(&self, key: &CharacteristicKey) -> OperationResult<Subscription> {
        let scope = self
            .registry
            .connected_scope(&key.device_id)
            .map_err(|failure| failure.with_characteristic(key.clone()))?;
        self.notifications.subscribe(key, &scope).await
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.notifications.unsubscribe(handle).await;
    }

    pub async fn negotiate_mtu(&self, device: &DeviceId, size: u16) -> OperationResult<u16> {
        self.operations.negotiate_mtu(device, size).await
    }

    pub async fn request_connection_priority(
        &self,
        device: &DeviceId,
        priority: ConnectionPriority,
    ) -> OperationResult<()> {
        self.operations
            .request_connection_priority(device, priority)
            .await
    }
}
