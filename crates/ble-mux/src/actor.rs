//! Bridge Actor
//!
//! This module provides the async actor that dispatches host requests to the
//! bridge core. Every request kind is one variant of [`BleRequest`] and is
//! handled by one exhaustive `match`.
//!
//! # Architecture
//!
//! The actor receives commands through a channel. Each request carries a
//! oneshot sender for its single response. Requests that talk to the radio
//! are spawned as their own tasks so a slow device never holds up another.
//! Connect requests, write submissions, scan start/stop and notification
//! start/stop are queued inside the actor loop, so requests that touch the
//! same device, characteristic or scan take effect in arrival order.
//!
//! A response whose requester went away is dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! use ble_mux::{BleBridge, BridgeConfig, BridgeHandle};
//! use ble_protocol::BleRequest;
//!
//! let (bridge, mut events) = BleBridge::new(radio, BridgeConfig::default())?;
//! let (handle, _task) = BridgeHandle::spawn(bridge);
//!
//! let status = handle.request(BleRequest::Status).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ble_protocol::{BleRequest, BleResponse, CharacteristicKey};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::BleBridge;
use crate::error::BridgeError;
use crate::events::CharacteristicUpdate;
use crate::notify::{SubscriptionHandle, SubscriptionId};
use crate::queue::SerialQueues;

/// Commands sent to the bridge actor
#[derive(Debug)]
pub enum BridgeCommand {
    /// A host request
    Request {
        /// The decoded request
        request: BleRequest,
        /// Channel for the single response
        response: oneshot::Sender<BleResponse>,
    },

    /// Shutdown the actor, disconnecting every device
    Shutdown,
}

/// Notification listeners held on behalf of the host, one per characteristic
#[derive(Default)]
struct HostListeners {
    by_key: Mutex<HashMap<CharacteristicKey, SubscriptionHandle>>,
}

impl HostListeners {
    fn contains(&self, key: &CharacteristicKey) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CharacteristicKey, SubscriptionHandle>> {
        self.by_key.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a listener; returns false if one is already recorded for the key
    fn insert(&self, handle: SubscriptionHandle) -> bool {
        let mut listeners = self.lock();
        if listeners.contains_key(handle.key()) {
            return false;
        }
        listeners.insert(handle.key().clone(), handle);
        true
    }

    fn take(&self, key: &CharacteristicKey) -> Option<SubscriptionHandle> {
        self.lock().remove(key)
    }

    /// Forget a listener whose value stream ended, unless it was replaced
    fn forget(&self, key: &CharacteristicKey, id: SubscriptionId) {
        let mut listeners = self.lock();
        if listeners.get(key).map(SubscriptionHandle::id) == Some(id) {
            listeners.remove(key);
        }
    }

    /// Unsubscribe every host listener
    async fn release_all(&self, bridge: &BleBridge) {
        let handles: Vec<SubscriptionHandle> = self.lock().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            bridge.unsubscribe(&handle).await;
        }
    }
}

enum ListenerChange {
    Start,
    Stop,
}

/// A queued notification start or stop
struct ListenerJob {
    change: ListenerChange,
    characteristic: CharacteristicKey,
    response: oneshot::Sender<BleResponse>,
}

/// Internal state for the bridge actor
struct BridgeActorState {
    bridge: Arc<BleBridge>,
    listeners: Arc<HostListeners>,
    listener_changes: SerialQueues<CharacteristicKey, ListenerJob>,
}

impl BridgeActorState {
    fn new(bridge: Arc<BleBridge>) -> Self {
        Self {
            bridge,
            listeners: Arc::new(HostListeners::default()),
            listener_changes: SerialQueues::default(),
        }
    }

    /// Queue a listener change behind earlier changes for the same key
    fn change_listener(
        &self,
        change: ListenerChange,
        characteristic: CharacteristicKey,
        response: oneshot::Sender<BleResponse>,
    ) {
        let bridge = self.bridge.clone();
        let listeners = self.listeners.clone();
        let key = characteristic.clone();
        let job = ListenerJob {
            change,
            characteristic,
            response,
        };

        self.listener_changes.push(&key, job, move |job: ListenerJob| {
            let bridge = bridge.clone();
            let listeners = listeners.clone();
            async move {
                let result = match job.change {
                    ListenerChange::Start => {
                        start_host_listener(&bridge, &listeners, &job.characteristic).await
                    }
                    ListenerChange::Stop => {
                        if let Some(handle) = listeners.take(&job.characteristic) {
                            bridge.unsubscribe(&handle).await;
                        }
                        Ok(())
                    }
                };
                let _ = job.response.send(BleResponse::Notifications {
                    characteristic: job.characteristic,
                    result,
                });
            }
        });
    }
}

/// Spawn work that answers a request
fn reply_with<F>(response: oneshot::Sender<BleResponse>, work: F)
where
    F: Future<Output = BleResponse> + Send + 'static,
{
    tokio::spawn(async move {
        let _ = response.send(work.await);
    });
}

fn dispatch(state: &BridgeActorState, request: BleRequest, response: oneshot::Sender<BleResponse>) {
    debug!("Dispatching {}", request.name());
    let bridge = state.bridge.clone();

    match request {
        BleRequest::Initialize => {
            let listeners = state.listeners.clone();
            reply_with(response, async move {
                listeners.release_all(&bridge).await;
                bridge.initialize().await;
                BleResponse::done()
            });
        }

        BleRequest::Deinitialize => {
            let listeners = state.listeners.clone();
            reply_with(response, async move {
                listeners.release_all(&bridge).await;
                bridge.deinitialize().await;
                BleResponse::done()
            });
        }

        BleRequest::Status => {
            reply_with(response, async move {
                BleResponse::Status {
                    status: bridge.status().await,
                }
            });
        }

        BleRequest::ScanForDevices { filter } => {
            let pending = bridge.start_scan(filter);
            reply_with(response, async move {
                pending.await;
                BleResponse::done()
            });
        }

        BleRequest::StopScan => {
            let pending = bridge.stop_scan();
            reply_with(response, async move {
                pending.await;
                BleResponse::done()
            });
        }

        BleRequest::ConnectToDevice {
            device_id,
            timeout_ms,
        } => {
            let result = bridge.connect(&device_id, timeout_ms.map(Duration::from_millis));
            let _ = response.send(BleResponse::Connection { device_id, result });
        }

        BleRequest::DisconnectFromDevice { device_id } => {
            reply_with(response, async move {
                bridge.disconnect(&device_id).await;
                BleResponse::done()
            });
        }

        BleRequest::ClearGattCache { device_id } => {
            reply_with(response, async move {
                let result = bridge.clear_gatt_cache(&device_id).await;
                BleResponse::GattCacheCleared { device_id, result }
            });
        }

        BleRequest::ReadCharacteristic { characteristic } => {
            reply_with(response, async move {
                let result = bridge.read(&characteristic).await;
                bridge.events().characteristic(CharacteristicUpdate {
                    key: characteristic.clone(),
                    result: result.clone(),
                });
                BleResponse::Value {
                    characteristic,
                    result,
                }
            });
        }

        BleRequest::WriteCharacteristic {
            characteristic,
            value,
            write_type,
        } => {
            let pending = bridge.write(&characteristic, value, write_type);
            reply_with(response, async move {
                BleResponse::Written {
                    characteristic,
                    result: pending.await,
                }
            });
        }

        BleRequest::ReadNotifications { characteristic } => {
            state.change_listener(ListenerChange::Start, characteristic, response);
        }

        BleRequest::StopNotifications { characteristic } => {
            state.change_listener(ListenerChange::Stop, characteristic, response);
        }

        BleRequest::NegotiateMtuSize {
            device_id,
            mtu_size,
        } => {
            reply_with(response, async move {
                let result = bridge.negotiate_mtu(&device_id, mtu_size).await;
                BleResponse::Mtu { device_id, result }
            });
        }

        BleRequest::RequestConnectionPriority {
            device_id,
            priority,
        } => {
            reply_with(response, async move {
                let result = bridge
                    .request_connection_priority(&device_id, priority)
                    .await;
                BleResponse::ConnectionPriority { device_id, result }
            });
        }
    }
}

/// Subscribe on behalf of the host and forward values to the event stream
async fn start_host_listener(
    bridge: &Arc<BleBridge>,
    listeners: &Arc<HostListeners>,
    key: &CharacteristicKey,
) -> ble_protocol::OperationResult<()> {
    if listeners.contains(key) {
        debug!("Host already listening on {}", key);
        return Ok(());
    }

    let (handle, mut values) = bridge.subscribe(key).await?.into_parts();
    if !listeners.insert(handle.clone()) {
        // Already recorded for this key
        bridge.unsubscribe(&handle).await;
        return Ok(());
    }

    let events = bridge.events().clone();
    let listeners = listeners.clone();
    tokio::spawn(async move {
        while let Some(result) = values.recv().await {
            events.characteristic(CharacteristicUpdate {
                key: handle.key().clone(),
                result,
            });
        }
        listeners.forget(handle.key(), handle.id());
        debug!("Host listener on {} ended", handle.key());
    });

    Ok(())
}

/// Run the bridge actor
///
/// Adapter status changes are forwarded to the status stream while it runs.
///
/// Returns after a `Shutdown` command or once every handle was dropped. Either
/// way every device is disconnected before returning.
pub async fn run_bridge_actor(bridge: Arc<BleBridge>, mut cmd_rx: mpsc::Receiver<BridgeCommand>) {
    let state = BridgeActorState::new(bridge);
    state.bridge.watch_status().await;
    info!("Bridge actor started");

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            BridgeCommand::Request { request, response } => dispatch(&state, request, response),
            BridgeCommand::Shutdown => {
                info!("Bridge actor shutting down");
                break;
            }
        }
    }

    state.listeners.release_all(&state.bridge).await;
    state.bridge.deinitialize().await;
    state.bridge.unwatch_status();
    info!("Bridge actor stopped");
}

/// Cloneable handle for sending requests to the bridge actor
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    cmd_tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Spawn the actor for a bridge
    pub fn spawn(bridge: BleBridge) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(bridge.config().command_buffer);
        let task = tokio::spawn(run_bridge_actor(Arc::new(bridge), cmd_rx));
        (Self { cmd_tx }, task)
    }

    /// Wrap an existing command sender
    pub fn from_sender(cmd_tx: mpsc::Sender<BridgeCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Send a request without waiting for the response
    pub async fn submit(
        &self,
        request: BleRequest,
    ) -> Result<oneshot::Receiver<BleResponse>, BridgeError> {
        let (response, rx) = oneshot::channel();
        self.cmd_tx
            .send(BridgeCommand::Request { request, response })
            .await
            .map_err(|_| BridgeError::ActorStopped)?;
        Ok(rx)
    }

    /// Send a request and wait for its response
    pub async fn request(&self, request: BleRequest) -> Result<BleResponse, BridgeError> {
        let name = request.name();
        self.submit(request)
            .await?
            .await
            .map_err(|_| BridgeError::ResponseDropped(name))
    }

    /// Ask the actor to stop
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.cmd_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ActorStopped)
    }
}
