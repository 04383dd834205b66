//! Virtual radio simulation
//!
//! Provides a scriptable implementation of the radio capability. Tests and the
//! bridge binary drive it directly: they add peripherals, choose how each
//! operation answers, push notification values and drop links, then inspect
//! the call log to see what the bridge asked the radio to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ble_protocol::{
    BleRadio, BleStatus, CharacteristicKey, ConnectionPriority, DeviceId, LinkEvent, LinkEvents,
    NotificationStream, RadioError, ScanFilter, ScanInfo, ScanStream, StatusStream, WriteType,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SimError;
use crate::peripheral::{Behavior, VirtualCharacteristic, VirtualPeripheral, VirtualPeripheralConfig};

/// Buffer size of the streams handed out by the virtual radio
const STREAM_BUFFER: usize = 64;

/// Smallest ATT MTU
const MIN_MTU: u16 = 23;

/// MTU in effect after a negotiation request
fn effective_mtu(requested: u16, limit: u16) -> u16 {
    requested.clamp(MIN_MTU, limit.max(MIN_MTU))
}

/// A write the radio received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Written characteristic
    pub key: CharacteristicKey,
    /// Written bytes
    pub value: Vec<u8>,
    /// Acknowledgement mode
    pub write_type: WriteType,
}

/// Every call the radio received, in arrival order
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub scans: usize,
    pub connects: Vec<DeviceId>,
    pub disconnects: Vec<DeviceId>,
    pub gatt_cache_clears: Vec<DeviceId>,
    pub reads: Vec<CharacteristicKey>,
    pub writes: Vec<WriteRecord>,
    pub setups: Vec<CharacteristicKey>,
    pub teardowns: Vec<CharacteristicKey>,
    pub mtu_requests: Vec<(DeviceId, u16)>,
    pub priority_requests: Vec<(DeviceId, ConnectionPriority)>,
}

impl CallLog {
    /// Number of physical connect calls for a device
    pub fn connects_to(&self, device: &DeviceId) -> usize {
        self.connects.iter().filter(|d| *d == device).count()
    }

    /// Number of disconnect calls for a device
    pub fn disconnects_from(&self, device: &DeviceId) -> usize {
        self.disconnects.iter().filter(|d| *d == device).count()
    }

    /// Number of notification setups for a characteristic
    pub fn setups_of(&self, key: &CharacteristicKey) -> usize {
        self.setups.iter().filter(|k| *k == key).count()
    }

    /// Number of notification teardowns for a characteristic
    pub fn teardowns_of(&self, key: &CharacteristicKey) -> usize {
        self.teardowns.iter().filter(|k| *k == key).count()
    }

    /// Writes received for a characteristic
    pub fn writes_to(&self, key: &CharacteristicKey) -> Vec<&WriteRecord> {
        self.writes.iter().filter(|w| w.key == *key).collect()
    }
}

#[derive(Debug)]
struct SimState {
    status: BleStatus,
    status_watchers: Vec<mpsc::Sender<BleStatus>>,
    peripherals: HashMap<DeviceId, VirtualPeripheral>,
    links: HashMap<DeviceId, mpsc::Sender<LinkEvent>>,
    notifications: HashMap<CharacteristicKey, mpsc::Sender<Result<Vec<u8>, RadioError>>>,
    scan: Option<(ScanFilter, mpsc::Sender<Result<ScanInfo, RadioError>>)>,
    writes_in_flight: HashMap<CharacteristicKey, usize>,
    max_writes_in_flight: HashMap<CharacteristicKey, usize>,
    calls: CallLog,
}

impl SimState {
    fn ensure_ready(&self) -> Result<(), RadioError> {
        match self.status {
            BleStatus::Ready => Ok(()),
            other => Err(RadioError::Fault(format!("adapter not ready: {:?}", other))),
        }
    }

    fn ensure_linked(&self, device: &DeviceId) -> Result<(), RadioError> {
        if self.links.contains_key(device) {
            Ok(())
        } else {
            Err(RadioError::Disconnected(format!("{} is not connected", device)))
        }
    }

    fn peripheral(&self, device: &DeviceId) -> Result<&VirtualPeripheral, RadioError> {
        self.peripherals
            .get(device)
            .ok_or_else(|| RadioError::Unreachable(format!("no peripheral {}", device)))
    }

    fn characteristic(&self, key: &CharacteristicKey) -> Result<&VirtualCharacteristic, RadioError> {
        let peripheral = self.peripheral(&key.device_id)?;
        peripheral
            .characteristics
            .get(&key.characteristic)
            .filter(|c| key.service.is_none() || c.config.service == key.service)
            .ok_or_else(|| RadioError::Rejected(format!("unknown characteristic {}", key)))
    }

    fn characteristic_mut(
        &mut self,
        key: &CharacteristicKey,
    ) -> Option<&mut VirtualCharacteristic> {
        self.peripherals
            .get_mut(&key.device_id)?
            .characteristics
            .get_mut(&key.characteristic)
    }
}

/// Wait out a scripted behavior
async fn settle(behavior: Behavior) -> Result<(), RadioError> {
    match behavior {
        Behavior::Respond => Ok(()),
        Behavior::Delay(delay) => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
        Behavior::Fail(error) => Err(error),
        Behavior::Hang => std::future::pending().await,
    }
}

/// Decrements the in-flight write count even if the write future is dropped
struct InFlightWrite {
    state: Arc<Mutex<SimState>>,
    key: CharacteristicKey,
}

impl Drop for InFlightWrite {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = state.writes_in_flight.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
    }
}

/// A simulated BLE radio
///
/// Cloning yields another handle to the same simulated radio.
#[derive(Debug, Clone)]
pub struct VirtualRadio {
    state: Arc<Mutex<SimState>>,
}

impl Default for VirtualRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualRadio {
    /// Create a ready radio with no peripherals
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                status: BleStatus::Ready,
                status_watchers: Vec::new(),
                peripherals: HashMap::new(),
                links: HashMap::new(),
                notifications: HashMap::new(),
                scan: None,
                writes_in_flight: HashMap::new(),
                max_writes_in_flight: HashMap::new(),
                calls: CallLog::default(),
            })),
        }
    }

    /// Create a radio populated with peripherals
    pub fn with_peripherals(
        configs: impl IntoIterator<Item = VirtualPeripheralConfig>,
    ) -> Result<Self, SimError> {
        let radio = Self::new();
        for config in configs {
            radio.add_peripheral(config)?;
        }
        Ok(radio)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a peripheral; it is advertised to running and future scans
    pub fn add_peripheral(&self, config: VirtualPeripheralConfig) -> Result<DeviceId, SimError> {
        let peripheral = VirtualPeripheral::from_config(config);
        let id = peripheral.id.clone();
        let mut state = self.lock();

        if state.peripherals.contains_key(&id) {
            return Err(SimError::DuplicatePeripheral(id));
        }

        if let Some((filter, tx)) = &state.scan {
            let info = peripheral.scan_info();
            if filter.matches(&info) {
                let _ = tx.try_send(Ok(info));
            }
        }

        info!("Added virtual peripheral {}", id);
        state.peripherals.insert(id.clone(), peripheral);
        Ok(id)
    }

    /// Set the adapter status reported to the bridge
    ///
    /// Watchers are told only when the status actually changes.
    pub fn set_status(&self, status: BleStatus) {
        let mut state = self.lock();
        if state.status == status {
            return;
        }
        state.status = status;
        state
            .status_watchers
            .retain(|tx| !matches!(tx.try_send(status), Err(TrySendError::Closed(_))));
    }

    /// Choose how connect calls for a device answer
    pub fn set_connect_behavior(&self, device: &DeviceId, behavior: Behavior) -> Result<(), SimError> {
        let mut state = self.lock();
        let peripheral = state
            .peripherals
            .get_mut(device)
            .ok_or_else(|| SimError::UnknownPeripheral(device.clone()))?;
        peripheral.connect_behavior = behavior;
        Ok(())
    }

    /// Choose how disconnect calls for a device answer
    pub fn set_disconnect_behavior(
        &self,
        device: &DeviceId,
        behavior: Behavior,
    ) -> Result<(), SimError> {
        let mut state = self.lock();
        let peripheral = state
            .peripherals
            .get_mut(device)
            .ok_or_else(|| SimError::UnknownPeripheral(device.clone()))?;
        peripheral.disconnect_behavior = behavior;
        Ok(())
    }

    /// Choose how reads of a characteristic answer
    pub fn set_read_behavior(&self, key: &CharacteristicKey, behavior: Behavior) -> Result<(), SimError> {
        self.with_characteristic(key, |c| c.read_behavior = behavior)
    }

    /// Choose how writes to a characteristic answer
    pub fn set_write_behavior(&self, key: &CharacteristicKey, behavior: Behavior) -> Result<(), SimError> {
        self.with_characteristic(key, |c| c.write_behavior = behavior)
    }

    /// Choose how notification setups for a characteristic answer
    pub fn set_setup_behavior(&self, key: &CharacteristicKey, behavior: Behavior) -> Result<(), SimError> {
        self.with_characteristic(key, |c| c.setup_behavior = behavior)
    }

    fn with_characteristic(
        &self,
        key: &CharacteristicKey,
        apply: impl FnOnce(&mut VirtualCharacteristic),
    ) -> Result<(), SimError> {
        let mut state = self.lock();
        let characteristic = state
            .characteristic_mut(key)
            .ok_or_else(|| SimError::UnknownCharacteristic(key.clone()))?;
        apply(characteristic);
        Ok(())
    }

    /// Snapshot of every call received so far
    pub fn calls(&self) -> CallLog {
        self.lock().calls.clone()
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.lock().scan.is_some()
    }

    /// Number of live status watchers
    pub fn status_watchers(&self) -> usize {
        self.lock().status_watchers.iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Whether a link to the device is up
    pub fn is_linked(&self, device: &DeviceId) -> bool {
        self.lock().links.contains_key(device)
    }

    /// Whether notifications are enabled for a characteristic
    pub fn notification_active(&self, key: &CharacteristicKey) -> bool {
        self.lock().notifications.contains_key(key)
    }

    /// Current value of a characteristic
    pub fn characteristic_value(&self, key: &CharacteristicKey) -> Option<Vec<u8>> {
        self.lock().characteristic(key).ok().map(|c| c.value.clone())
    }

    /// Highest number of writes that were in flight at once for a characteristic
    pub fn max_concurrent_writes(&self, key: &CharacteristicKey) -> usize {
        self.lock()
            .max_writes_in_flight
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Push a notification value; returns false if notifications are not enabled
    pub async fn emit_notification(&self, key: &CharacteristicKey, value: Vec<u8>) -> bool {
        let tx = {
            let mut state = self.lock();
            if let Some(characteristic) = state.characteristic_mut(key) {
                characteristic.value = value.clone();
            }
            state.notifications.get(key).cloned()
        };

        match tx {
            Some(tx) => tx.send(Ok(value)).await.is_ok(),
            None => false,
        }
    }

    /// Fail the notification stream of a characteristic
    pub async fn fail_notification(&self, key: &CharacteristicKey, error: RadioError) -> bool {
        let tx = self.lock().notifications.remove(key);
        match tx {
            Some(tx) => tx.send(Err(error)).await.is_ok(),
            None => false,
        }
    }

    /// Drop the link to a device as if it went out of range
    pub fn drop_link(&self, device: &DeviceId, error: RadioError) -> bool {
        let mut state = self.lock();
        state.notifications.retain(|key, _| key.device_id != *device);
        match state.links.remove(device) {
            Some(tx) => {
                info!("Dropping virtual link to {}", device);
                let _ = tx.try_send(LinkEvent::Lost(error));
                true
            }
            None => false,
        }
    }

    fn spawn_notifier(
        &self,
        key: CharacteristicKey,
        tx: mpsc::Sender<Result<Vec<u8>, RadioError>>,
        period: Duration,
    ) {
        let radio = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(value) = radio.characteristic_value(&key) else {
                    break;
                };
                if tx.send(Ok(value)).await.is_err() {
                    break;
                }
            }
            debug!("Periodic notifier for {} stopped", key);
        });
    }
}

#[async_trait]
impl BleRadio for VirtualRadio {
    async fn status(&self) -> BleStatus {
        self.lock().status
    }

    async fn observe_status(&self) -> Result<StatusStream, RadioError> {
        let mut state = self.lock();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        // Fresh channel, cannot be full
        let _ = tx.try_send(state.status);
        state.status_watchers.push(tx);
        Ok(rx)
    }

    async fn scan(&self, filter: ScanFilter) -> Result<ScanStream, RadioError> {
        let mut state = self.lock();
        state.calls.scans += 1;
        state.ensure_ready()?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        for peripheral in state.peripherals.values() {
            let info = peripheral.scan_info();
            if filter.matches(&info) {
                let _ = tx.try_send(Ok(info));
            }
        }
        state.scan = Some((filter, tx));
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.lock().scan = None;
        Ok(())
    }

    async fn connect(
        &self,
        device: &DeviceId,
        _timeout: Option<Duration>,
    ) -> Result<LinkEvents, RadioError> {
        let behavior = {
            let mut state = self.lock();
            state.calls.connects.push(device.clone());
            state.ensure_ready()?;
            state.peripheral(device)?.connect_behavior.clone()
        };

        settle(behavior).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.lock().links.insert(device.clone(), tx);
        debug!("Virtual link to {} established", device);
        Ok(rx)
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), RadioError> {
        let behavior = {
            let mut state = self.lock();
            state.calls.disconnects.push(device.clone());
            state
                .peripheral(device)
                .map(|p| p.disconnect_behavior.clone())
                .unwrap_or_default()
        };

        settle(behavior).await?;

        let mut state = self.lock();
        state.links.remove(device);
        state.notifications.retain(|key, _| key.device_id != *device);
        Ok(())
    }

    async fn clear_gatt_cache(&self, device: &DeviceId) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.calls.gatt_cache_clears.push(device.clone());
        if !state.peripheral(device)?.config.supports_gatt_cache_clear {
            return Err(RadioError::Unsupported(
                "clearing the GATT cache is not supported".to_string(),
            ));
        }
        Ok(())
    }

    async fn read(&self, key: &CharacteristicKey) -> Result<Vec<u8>, RadioError> {
        let behavior = {
            let mut state = self.lock();
            state.calls.reads.push(key.clone());
            state.ensure_linked(&key.device_id)?;
            let characteristic = state.characteristic(key)?;
            if !characteristic.config.readable {
                return Err(RadioError::Rejected(format!("{} is not readable", key)));
            }
            characteristic.read_behavior.clone()
        };

        settle(behavior).await?;

        let state = self.lock();
        state.ensure_linked(&key.device_id)?;
        Ok(state.characteristic(key)?.value.clone())
    }

    async fn write(
        &self,
        key: &CharacteristicKey,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        let behavior = {
            let mut state = self.lock();
            state.calls.writes.push(WriteRecord {
                key: key.clone(),
                value: value.to_vec(),
                write_type,
            });
            state.ensure_linked(&key.device_id)?;
            let characteristic = state.characteristic(key)?;
            if !characteristic.config.writable {
                return Err(RadioError::Rejected(format!("{} is not writable", key)));
            }
            let behavior = characteristic.write_behavior.clone();

            let in_flight = state.writes_in_flight.entry(key.clone()).or_insert(0);
            *in_flight += 1;
            let now = *in_flight;
            let max = state.max_writes_in_flight.entry(key.clone()).or_insert(0);
            *max = (*max).max(now);
            behavior
        };

        let _guard = InFlightWrite {
            state: self.state.clone(),
            key: key.clone(),
        };
        settle(behavior).await?;

        let mut state = self.lock();
        state.ensure_linked(&key.device_id)?;
        if let Some(characteristic) = state.characteristic_mut(key) {
            characteristic.value = value.to_vec();
        }
        Ok(())
    }

    async fn setup_notification(
        &self,
        key: &CharacteristicKey,
    ) -> Result<NotificationStream, RadioError> {
        let behavior = {
            let mut state = self.lock();
            state.calls.setups.push(key.clone());
            state.ensure_linked(&key.device_id)?;
            let characteristic = state.characteristic(key)?;
            if !characteristic.config.notify {
                return Err(RadioError::Rejected(format!(
                    "{} does not support notifications",
                    key
                )));
            }
            characteristic.setup_behavior.clone()
        };

        settle(behavior).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let period = {
            let mut state = self.lock();
            state.ensure_linked(&key.device_id)?;
            state.notifications.insert(key.clone(), tx.clone());
            state
                .characteristic(key)?
                .config
                .notify_interval_ms
                .map(Duration::from_millis)
        };

        if let Some(period) = period {
            self.spawn_notifier(key.clone(), tx, period);
        }
        Ok(rx)
    }

    async fn teardown_notification(&self, key: &CharacteristicKey) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.calls.teardowns.push(key.clone());
        state.notifications.remove(key);
        Ok(())
    }

    async fn negotiate_mtu(&self, device: &DeviceId, size: u16) -> Result<u16, RadioError> {
        let mut state = self.lock();
        state.calls.mtu_requests.push((device.clone(), size));
        state.ensure_linked(device)?;
        let peripheral = state
            .peripherals
            .get_mut(device)
            .ok_or_else(|| RadioError::Unreachable(format!("no peripheral {}", device)))?;
        peripheral.mtu = effective_mtu(size, peripheral.config.mtu_limit);
        Ok(peripheral.mtu)
    }

    async fn request_connection_priority(
        &self,
        device: &DeviceId,
        priority: ConnectionPriority,
    ) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.calls.priority_requests.push((device.clone(), priority));
        state.ensure_linked(device)?;
        if !state.peripheral(device)?.config.supports_connection_priority {
            return Err(RadioError::Unsupported(
                "connection priority requests are not supported".to_string(),
            ));
        }
        Ok(())
    }
}

/// Build a characteristic key for a virtual peripheral (test and demo helper)
pub fn characteristic_key(device: &str, characteristic: u128) -> CharacteristicKey {
    CharacteristicKey::new(DeviceId::from(device), Uuid::from_u128(characteristic))
}
