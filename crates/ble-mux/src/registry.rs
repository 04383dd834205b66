//! Connection registry
//!
//! Tracks the connection state of every device the host asked about and
//! guarantees a single physical connection per device. Every state
//! transition is emitted as exactly one [`ConnectionUpdate`].
//!
//! # Connection scopes
//!
//! Each connection attempt gets a fresh generation number and a
//! [`CancellationToken`]. All work started on behalf of that connection
//! (pending operations, notification pumps, the link watcher) runs under the
//! token, so cancelling it on disconnect or link loss resolves every piece of
//! device-scoped work at once. The generation keeps a late completion of an
//! old attempt from touching a newer connection to the same device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ble_protocol::{
    BleRadio, ConnectOutcome, ConnectionState, DeviceId, Failure, FailureKind, LinkEvent,
    LinkEvents, OperationResult, RadioError,
};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{ConnectionUpdate, EventSink};
use crate::notify::NotificationMultiplexer;
use crate::operations::run_bounded;

#[derive(Debug)]
struct DeviceEntry {
    state: ConnectionState,
    generation: u64,
    scope: CancellationToken,
}

struct Inner {
    radio: Arc<dyn BleRadio>,
    notifications: Arc<NotificationMultiplexer>,
    events: EventSink,
    devices: Mutex<HashMap<DeviceId, DeviceEntry>>,
    next_generation: AtomicU64,
    connect_timeout: Duration,
    operation_timeout: Duration,
}

/// Per-device connection state machine
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    /// Create a registry
    ///
    /// `connect_timeout` applies when a connect request carries no deadline;
    /// `operation_timeout` bounds disconnect and GATT cache requests.
    pub fn new(
        radio: Arc<dyn BleRadio>,
        notifications: Arc<NotificationMultiplexer>,
        events: EventSink,
        connect_timeout: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                radio,
                notifications,
                events,
                devices: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                connect_timeout,
                operation_timeout,
            }),
        }
    }

    /// Start connecting, or attach to a connection already in progress
    ///
    /// Returns as soon as the attempt is registered; the outcome arrives as
    /// connection updates.
    pub fn connect(
        &self,
        device: &DeviceId,
        timeout: Option<Duration>,
    ) -> OperationResult<ConnectOutcome> {
        let timeout = timeout.unwrap_or(self.inner.connect_timeout);

        let (generation, scope) = {
            let mut devices = self.inner.lock();
            match devices.get(device).map(|entry| entry.state) {
                Some(state) if state.is_active() => {
                    debug!("Connect to {} attached to existing {} link", device, state);
                    return Ok(ConnectOutcome::Attached);
                }
                Some(ConnectionState::Disconnecting) => {
                    return Err(Failure::new(
                        FailureKind::ConnectionFailure,
                        device,
                        format!("device {} is disconnecting", device),
                    ));
                }
                _ => {}
            }

            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let scope = CancellationToken::new();
            devices.insert(
                device.clone(),
                DeviceEntry {
                    state: ConnectionState::Connecting,
                    generation,
                    scope: scope.clone(),
                },
            );
            // Emitted under the lock so updates of one device stay in order
            self.inner
                .events
                .connection(ConnectionUpdate::new(device.clone(), ConnectionState::Connecting));
            (generation, scope)
        };

        info!("Connecting to {} (timeout {:?})", device, timeout);
        let inner = self.inner.clone();
        let device = device.clone();
        tokio::spawn(async move { inner.establish(device, generation, scope, timeout).await });

        Ok(ConnectOutcome::Started)
    }

    /// Disconnect a device, failing all of its pending work
    ///
    /// Devices without an entry are left alone.
    pub async fn disconnect(&self, device: &DeviceId) {
        let (generation, scope) = {
            let mut devices = self.inner.lock();
            let Some(entry) = devices.get_mut(device) else {
                debug!("Disconnect from untracked device {} ignored", device);
                return;
            };

            let state = entry.state;
            match state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    entry.state = ConnectionState::Disconnecting;
                    self.inner.events.connection(ConnectionUpdate::new(
                        device.clone(),
                        ConnectionState::Disconnecting,
                    ));
                    (entry.generation, entry.scope.clone())
                }
                ConnectionState::Disconnecting => {
                    debug!("Disconnect from {} already in progress", device);
                    return;
                }
                ConnectionState::Disconnected => {
                    devices.remove(device);
                    return;
                }
            }
        };

        info!("Disconnecting from {}", device);
        scope.cancel();
        self.inner
            .notifications
            .release_device(device, Failure::disconnected(device))
            .await;

        let inner = &self.inner;
        let result = run_bounded(
            device,
            &CancellationToken::new(),
            inner.operation_timeout,
            inner.radio.disconnect(device),
        )
        .await;
        if let Err(failure) = result {
            warn!("Radio disconnect from {} failed: {}", device, failure);
        }

        let mut devices = inner.lock();
        if devices.get(device).map(|entry| entry.generation) == Some(generation) {
            devices.remove(device);
            inner
                .events
                .connection(ConnectionUpdate::new(device.clone(), ConnectionState::Disconnected));
            info!("Disconnected from {}", device);
        }
    }

    /// Disconnect every tracked device
    pub async fn disconnect_all(&self) {
        let devices = self.tracked_devices();
        if devices.is_empty() {
            return;
        }
        info!("Disconnecting {} device(s)", devices.len());
        join_all(devices.iter().map(|device| self.disconnect(device))).await;
    }

    /// Drop the radio's cached GATT database of a device
    ///
    /// Does not require a connection.
    pub async fn clear_gatt_cache(&self, device: &DeviceId) -> OperationResult<()> {
        let result = run_bounded(
            device,
            &CancellationToken::new(),
            self.inner.operation_timeout,
            self.inner.radio.clear_gatt_cache(device),
        )
        .await;
        if let Err(failure) = &result {
            debug!("Clearing GATT cache of {} failed: {}", device, failure);
        }
        result
    }

    /// Current state of a device; untracked devices are `Disconnected`
    pub fn state(&self, device: &DeviceId) -> ConnectionState {
        self.inner
            .lock()
            .get(device)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    /// Devices with a registry entry, sorted
    pub fn tracked_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.inner.lock().keys().cloned().collect();
        devices.sort();
        devices
    }

    /// Whether any device is in the `Connected` state
    pub fn has_established_connections(&self) -> bool {
        self.inner
            .lock()
            .values()
            .any(|entry| entry.state == ConnectionState::Connected)
    }

    /// Connection scope of a device, or a failure if it is not `Connected`
    pub fn connected_scope(&self, device: &DeviceId) -> OperationResult<CancellationToken> {
        match self.inner.lock().get(device) {
            Some(entry) if entry.state == ConnectionState::Connected => Ok(entry.scope.clone()),
            _ => Err(Failure::not_connected(device)),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, DeviceEntry>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn establish(
        self: Arc<Self>,
        device: DeviceId,
        generation: u64,
        scope: CancellationToken,
        timeout: Duration,
    ) {
        let attempt = tokio::time::timeout(timeout, self.radio.connect(&device, Some(timeout)));
        let outcome = tokio::select! {
            biased;
            // Disconnect requested while connecting; that path owns the state
            _ = scope.cancelled() => return,
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(Ok(link)) => {
                let promoted = {
                    let mut devices = self.lock();
                    match devices.get_mut(&device) {
                        Some(entry)
                            if entry.generation == generation
                                && entry.state == ConnectionState::Connecting =>
                        {
                            entry.state = ConnectionState::Connected;
                            self.events.connection(ConnectionUpdate::new(
                                device.clone(),
                                ConnectionState::Connected,
                            ));
                            true
                        }
                        _ => false,
                    }
                };

                if promoted {
                    info!("Connected to {}", device);
                    tokio::spawn(self.clone().watch_link(device, generation, scope, link));
                }
            }
            Ok(Err(error)) => {
                warn!("Connection to {} failed: {}", device, error);
                self.fail(&device, generation, Failure::from_radio(error, &device))
                    .await;
            }
            Err(_) => {
                let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!("Connection to {} timed out after {}ms", device, millis);
                self.fail(
                    &device,
                    generation,
                    Failure::from_radio(RadioError::Timeout(millis), &device),
                )
                .await;
                // The abandoned attempt may still hold radio resources
                if let Err(e) = self.radio.disconnect(&device).await {
                    debug!("Cleanup after connect timeout to {} failed: {}", device, e);
                }
            }
        }
    }

    async fn watch_link(
        self: Arc<Self>,
        device: DeviceId,
        generation: u64,
        scope: CancellationToken,
        mut link: LinkEvents,
    ) {
        let error = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            event = link.recv() => match event {
                Some(LinkEvent::Lost(error)) => error,
                None => RadioError::Disconnected("link closed".to_string()),
            },
        };

        warn!("Link to {} lost: {}", device, error);
        self.fail(&device, generation, Failure::from_radio(error, &device))
            .await;
    }

    /// Move a failed connection to `Disconnected` and release its work
    async fn fail(&self, device: &DeviceId, generation: u64, failure: Failure) {
        let scope = {
            let mut devices = self.lock();
            match devices.get(device) {
                Some(entry) if entry.generation == generation && entry.state.is_active() => {
                    let scope = entry.scope.clone();
                    devices.remove(device);
                    self.events
                        .connection(ConnectionUpdate::failed(device.clone(), failure.clone()));
                    Some(scope)
                }
                _ => None,
            }
        };

        if let Some(scope) = scope {
            scope.cancel();
            self.notifications.release_device(device, failure).await;
        }
    }
}
