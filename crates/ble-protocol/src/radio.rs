//! Radio capability interface
//!
//! The physical BLE stack is an external collaborator. The bridge core only
//! talks to it through [`BleRadio`]. Single results are returned from async
//! methods; ongoing values (scan results, link events, notifications) arrive
//! on `tokio::sync::mpsc` receivers handed out by the radio.
//!
//! Failures are always reported as [`RadioError`] values. Implementations
//! must never panic to signal a fault.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RadioError;
use crate::models::{BleStatus, ConnectionPriority, ScanFilter, ScanInfo, WriteType};
use crate::{CharacteristicKey, DeviceId};

/// Events reported on an established link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link went away without being asked to
    Lost(RadioError),
}

/// Stream of link events for one connection
///
/// The radio closes the stream when the link ends for any reason; the core
/// treats a closed stream like [`LinkEvent::Lost`].
pub type LinkEvents = mpsc::Receiver<LinkEvent>;

/// Stream of values for one underlying notification subscription
///
/// A single `Err` item is terminal for the subscription.
pub type NotificationStream = mpsc::Receiver<Result<Vec<u8>, RadioError>>;

/// Stream of advertisements for a running scan
pub type ScanStream = mpsc::Receiver<Result<ScanInfo, RadioError>>;

/// Stream of adapter status changes
pub type StatusStream = mpsc::Receiver<BleStatus>;

/// Operations the bridge core needs from the BLE radio stack
#[async_trait]
pub trait BleRadio: Send + Sync + 'static {
    /// Current adapter status
    async fn status(&self) -> BleStatus;

    /// Watch adapter status; the current status is the first item
    async fn observe_status(&self) -> Result<StatusStream, RadioError>;

    /// Start scanning; advertisements arrive on the returned stream
    async fn scan(&self, filter: ScanFilter) -> Result<ScanStream, RadioError>;

    /// Stop any running scan
    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Establish a link to a device
    ///
    /// Resolves once the link is up. The returned stream reports later link
    /// loss. `timeout` is a hint for the stack; the core enforces its own
    /// deadline as well.
    async fn connect(
        &self,
        device: &DeviceId,
        timeout: Option<Duration>,
    ) -> Result<LinkEvents, RadioError>;

    /// Tear down the link to a device
    async fn disconnect(&self, device: &DeviceId) -> Result<(), RadioError>;

    /// Drop the stack's cached GATT database for a device
    async fn clear_gatt_cache(&self, device: &DeviceId) -> Result<(), RadioError>;

    /// Read a characteristic value
    async fn read(&self, key: &CharacteristicKey) -> Result<Vec<u8>, RadioError>;

    /// Write a characteristic value
    async fn write(
        &self,
        key: &CharacteristicKey,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError>;

    /// Enable notifications on a characteristic
    async fn setup_notification(
        &self,
        key: &CharacteristicKey,
    ) -> Result<NotificationStream, RadioError>;

    /// Disable notifications on a characteristic
    async fn teardown_notification(&self, key: &CharacteristicKey) -> Result<(), RadioError>;

    /// Negotiate the ATT MTU; returns the MTU actually in effect
    async fn negotiate_mtu(&self, device: &DeviceId, size: u16) -> Result<u16, RadioError>;

    /// Change the connection interval preference
    async fn request_connection_priority(
        &self,
        device: &DeviceId,
        priority: ConnectionPriority,
    ) -> Result<(), RadioError>;
}
