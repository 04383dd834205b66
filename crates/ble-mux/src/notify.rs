//! Notification multiplexer
//!
//! Many logical listeners may subscribe to the same characteristic. The
//! multiplexer keeps at most one underlying notification channel per
//! [`CharacteristicKey`], creates it with the first listener and tears it down
//! when the last listener leaves.
//!
//! # Per-key slots
//!
//! Every key owns a slot behind its own `tokio::sync::Mutex`. Creating the
//! channel, adding and removing listeners, fanning out values and tearing the
//! channel down all happen while holding that slot lock, so the listener count
//! and the radio setup/teardown calls can never disagree. Different keys never
//! contend. A slot is dropped once it has neither listeners nor a channel.
//!
//! # Delivery
//!
//! Each listener owns an unbounded queue. A pump task per channel reads the
//! radio stream and pushes every value into every queue in arrival order; a
//! slow listener never delays the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ble_protocol::{
    BleRadio, CharacteristicKey, DeviceId, Failure, FailureKind, NotificationStream,
    OperationResult,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::operations::run_bounded;

/// Identifier of one logical listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Token used to cancel one listener
///
/// A handle stays valid only for the channel it was issued on. Once that
/// channel failed or was torn down, unsubscribing with it does nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    key: CharacteristicKey,
    id: SubscriptionId,
    generation: u64,
}

impl SubscriptionHandle {
    /// Characteristic the listener is attached to
    pub fn key(&self) -> &CharacteristicKey {
        &self.key
    }

    /// Identifier of the listener
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// One logical listener on a characteristic
///
/// Receives every value delivered after it subscribed. A `Failure` item is
/// the last item the listener will ever receive.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    values: mpsc::UnboundedReceiver<OperationResult<Vec<u8>>>,
}

impl Subscription {
    /// Handle for unsubscribing this listener
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Wait for the next value; `None` once the listener was removed
    pub async fn recv(&mut self) -> Option<OperationResult<Vec<u8>>> {
        self.values.recv().await
    }

    /// Take the next value if one is already queued
    pub fn try_recv(&mut self) -> Option<OperationResult<Vec<u8>>> {
        self.values.try_recv().ok()
    }

    /// Split into the handle and the raw value queue
    pub fn into_parts(
        self,
    ) -> (
        SubscriptionHandle,
        mpsc::UnboundedReceiver<OperationResult<Vec<u8>>>,
    ) {
        (self.handle, self.values)
    }
}

type Listener = mpsc::UnboundedSender<OperationResult<Vec<u8>>>;

#[derive(Debug)]
struct ActiveChannel {
    generation: u64,
    /// Connection scope the channel was opened under
    scope: CancellationToken,
    pump: CancellationToken,
}

#[derive(Debug, Default)]
struct Slot {
    /// Present iff the underlying channel exists (iff `listeners` is non-empty)
    active: Option<ActiveChannel>,
    listeners: HashMap<SubscriptionId, Listener>,
    /// Removed from the slot map; lockers must look the key up again
    retired: bool,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.active.is_none() && self.listeners.is_empty()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    /// Deliver a terminal failure to every listener and forget the channel
    fn fail(&mut self, failure: Failure) {
        if let Some(active) = self.active.take() {
            active.pump.cancel();
        }
        for (_, listener) in self.listeners.drain() {
            let _ = listener.send(Err(failure.clone()));
        }
    }
}

type SlotRef = Arc<AsyncMutex<Slot>>;
type SlotMap = Arc<Mutex<HashMap<CharacteristicKey, SlotRef>>>;

/// Drop an idle slot from the map
///
/// Must be called with the slot lock held (`slot` is the locked slot).
fn retire_if_idle(slots: &SlotMap, key: &CharacteristicKey, slot_ref: &SlotRef, slot: &mut Slot) {
    if !slot.is_idle() || slot.retired {
        return;
    }
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot_ref)) {
        slots.remove(key);
    }
    slot.retired = true;
}

/// Shares one radio notification channel per characteristic among listeners
pub struct NotificationMultiplexer {
    radio: Arc<dyn BleRadio>,
    slots: SlotMap,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    deadline: Duration,
}

impl NotificationMultiplexer {
    /// Create a multiplexer; `deadline` bounds radio setup and teardown calls
    pub fn new(radio: Arc<dyn BleRadio>, deadline: Duration) -> Self {
        Self {
            radio,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            deadline,
        }
    }

    fn slot(&self, key: &CharacteristicKey) -> SlotRef {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    fn existing_slot(&self, key: &CharacteristicKey) -> Option<SlotRef> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).cloned()
    }

    /// Register a listener, creating the underlying channel if needed
    ///
    /// `scope` is the connection scope of the device: once cancelled no new
    /// listener is admitted and the pump of a channel created here stops.
    pub async fn subscribe(
        &self,
        key: &CharacteristicKey,
        scope: &CancellationToken,
    ) -> OperationResult<Subscription> {
        let (slot, mut guard) = loop {
            let slot = self.slot(key);
            let guard = slot.clone().lock_owned().await;
            if !guard.retired {
                break (slot, guard);
            }
        };

        if scope.is_cancelled() {
            retire_if_idle(&self.slots, key, &slot, &mut guard);
            return Err(Failure::disconnected(&key.device_id).with_characteristic(key.clone()));
        }

        if guard.active.is_none() {
            let setup = run_bounded(
                &key.device_id,
                scope,
                self.deadline,
                self.radio.setup_notification(key),
            )
            .await;
            let stream = match setup {
                Ok(stream) => stream,
                Err(failure) => {
                    retire_if_idle(&self.slots, key, &slot, &mut guard);
                    return Err(failure.with_characteristic(key.clone()));
                }
            };

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let pump = scope.child_token();
            guard.active = Some(ActiveChannel {
                generation,
                scope: scope.clone(),
                pump: pump.clone(),
            });

            tokio::spawn(run_pump(
                PumpContext {
                    slots: self.slots.clone(),
                    slot: slot.clone(),
                    radio: self.radio.clone(),
                    key: key.clone(),
                    generation,
                    deadline: self.deadline,
                },
                stream,
                pump,
            ));
            info!("Notification channel opened for {}", key);
        }

        let generation = match &guard.active {
            Some(active) => active.generation,
            None => 0,
        };
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, values) = mpsc::unbounded_channel();
        guard.listeners.insert(id, tx);
        debug!(
            "Listener {} subscribed to {} ({} total)",
            id,
            key,
            guard.listeners.len()
        );

        Ok(Subscription {
            handle: SubscriptionHandle {
                key: key.clone(),
                id,
                generation,
            },
            values,
        })
    }

    /// Remove exactly one listener, tearing the channel down after the last
    ///
    /// Unknown or stale handles are ignored.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let Some(slot) = self.existing_slot(&handle.key) else {
            return;
        };
        let mut guard = slot.lock().await;

        if !guard.is_current(handle.generation) || guard.listeners.remove(&handle.id).is_none() {
            debug!("Ignoring stale unsubscribe {} on {}", handle.id, handle.key);
            return;
        }

        if guard.listeners.is_empty() {
            if let Some(active) = guard.active.take() {
                active.pump.cancel();
            }
            // Slot lock stays held so a concurrent subscribe cannot set up a
            // channel that this teardown would then remove.
            teardown(self.radio.as_ref(), &handle.key, self.deadline).await;
            retire_if_idle(&self.slots, &handle.key, &slot, &mut guard);
        }
    }

    /// Fail every listener of a device whose connection scope has ended
    ///
    /// Channels opened under a newer, still running connection to the same
    /// device are left alone. The radio is not asked to tear anything down:
    /// the link is gone.
    pub async fn release_device(&self, device: &DeviceId, failure: Failure) {
        let slots: Vec<(CharacteristicKey, SlotRef)> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .filter(|(key, _)| key.device_id == *device)
                .map(|(key, slot)| (key.clone(), slot.clone()))
                .collect()
        };

        for (key, slot) in slots {
            let mut guard = slot.lock().await;
            let ended = guard
                .active
                .as_ref()
                .is_some_and(|active| active.scope.is_cancelled());
            if ended {
                debug!("Releasing notification channel {}", key);
                guard.fail(failure.clone().with_characteristic(key.clone()));
                retire_if_idle(&self.slots, &key, &slot, &mut guard);
            }
        }
    }

    /// Number of listeners currently registered for a key
    pub async fn listener_count(&self, key: &CharacteristicKey) -> usize {
        match self.existing_slot(key) {
            Some(slot) => slot.lock().await.listeners.len(),
            None => 0,
        }
    }

    /// Whether the underlying channel for a key exists
    pub async fn is_active(&self, key: &CharacteristicKey) -> bool {
        match self.existing_slot(key) {
            Some(slot) => slot.lock().await.active.is_some(),
            None => false,
        }
    }

    /// Number of characteristics with listeners or an open channel
    pub fn tracked_keys(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn teardown(radio: &dyn BleRadio, key: &CharacteristicKey, deadline: Duration) {
    match tokio::time::timeout(deadline, radio.teardown_notification(key)).await {
        Ok(Ok(())) => info!("Notification channel closed for {}", key),
        Ok(Err(e)) => warn!("Notification teardown for {} failed: {}", key, e),
        Err(_) => warn!("Notification teardown for {} timed out", key),
    }
}

struct PumpContext {
    slots: SlotMap,
    slot: SlotRef,
    radio: Arc<dyn BleRadio>,
    key: CharacteristicKey,
    generation: u64,
    deadline: Duration,
}

async fn run_pump(ctx: PumpContext, mut stream: NotificationStream, cancel: CancellationToken) {
    let key = &ctx.key;
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = stream.recv() => item,
        };

        let mut guard = ctx.slot.lock().await;
        if !guard.is_current(ctx.generation) {
            break;
        }

        match item {
            Some(Ok(value)) => {
                guard
                    .listeners
                    .retain(|_, listener| listener.send(Ok(value.clone())).is_ok());

                if guard.listeners.is_empty() {
                    debug!("All listeners of {} went away", key);
                    guard.active = None;
                    teardown(ctx.radio.as_ref(), key, ctx.deadline).await;
                    retire_if_idle(&ctx.slots, key, &ctx.slot, &mut guard);
                    break;
                }
            }
            Some(Err(error)) => {
                warn!("Notification channel {} failed: {}", key, error);
                guard.fail(Failure::from_radio(error, &key.device_id).with_characteristic(key.clone()));
                retire_if_idle(&ctx.slots, key, &ctx.slot, &mut guard);
                break;
            }
            None => {
                warn!("Notification channel {} ended", key);
                guard.fail(Failure::for_characteristic(
                    FailureKind::ConnectionFailure,
                    key,
                    "notification stream ended",
                ));
                retire_if_idle(&ctx.slots, key, &ctx.slot, &mut guard);
                break;
            }
        }
    }
    debug!("Notification pump for {} stopped", key);
}
