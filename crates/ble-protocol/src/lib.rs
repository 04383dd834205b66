//! BLE Bridge Protocol Library
//!
//! This crate holds the vocabulary shared by every layer of the BLE bridge:
//!
//! - **Identifiers**: `DeviceId` and `CharacteristicKey`, the keys of all
//!   per-device and per-characteristic state
//! - **Connection states**: the `ConnectionState` machine tracked per device
//! - **Requests**: the `BleRequest` / `BleResponse` tagged unions exchanged with
//!   the host application
//! - **Failures**: the `FailureKind` taxonomy and the `OperationResult` shape
//!   every completion is normalized into
//! - **Radio capability**: the `BleRadio` trait implemented by the radio stack
//!
//! # Example
//!
//! ```rust
//! use ble_protocol::{CharacteristicKey, DeviceId, Failure, FailureKind, RadioError};
//! use uuid::Uuid;
//!
//! let key = CharacteristicKey::new(DeviceId::from("AA:BB:CC:DD:EE:FF"), Uuid::nil());
//!
//! // A rejection reported by the radio becomes a typed failure for the host
//! let failure = Failure::from_radio(RadioError::Rejected("not writable".into()), &key.device_id)
//!     .with_characteristic(key.clone());
//! assert_eq!(failure.kind, FailureKind::OperationRejected);
//! assert_eq!(failure.characteristic, Some(key));
//! ```

pub mod command;
pub mod error;
pub mod models;
pub mod radio;

use std::fmt;

use uuid::Uuid;

pub use command::{BleRequest, BleResponse, ConnectOutcome};
pub use error::{Failure, FailureKind, OperationResult, RadioError};
pub use models::{BleStatus, ConnectionPriority, ScanFilter, ScanInfo, ScanMode, WriteType};
pub use radio::{
    BleRadio, LinkEvent, LinkEvents, NotificationStream, ScanStream, StatusStream,
};

/// Opaque identifier of a physical peripheral
///
/// On most platforms this is the peripheral's MAC address, on others a
/// platform-assigned identifier. The bridge never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one characteristic on one device
///
/// Notification channels and write queues are keyed by this value. The
/// service is optional; when absent the radio resolves the first
/// characteristic with a matching UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicKey {
    /// Device exposing the characteristic
    pub device_id: DeviceId,
    /// Service the characteristic belongs to (if known)
    #[cfg_attr(feature = "serde", serde(default))]
    pub service: Option<Uuid>,
    /// Characteristic UUID
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    /// Create a key without a service qualifier
    pub fn new(device_id: DeviceId, characteristic: Uuid) -> Self {
        Self {
            device_id,
            service: None,
            characteristic,
        }
    }

    /// Qualify the key with a service UUID
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.service = Some(service);
        self
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service {
            Some(service) => write!(f, "{}/{}/{}", self.device_id, service, self.characteristic),
            None => write!(f, "{}/{}", self.device_id, self.characteristic),
        }
    }
}

/// Connection state of a single device
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
///                     |              |
///                     +--------------+----> Disconnected (failure / link drop)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// A physical connection attempt is in flight
    Connecting,
    /// The link is established
    Connected,
    /// A disconnect was requested and is in flight
    Disconnecting,
    /// No link; the terminal (and re-enterable) state
    #[default]
    Disconnected,
}

impl ConnectionState {
    /// Returns a human-readable name for the state
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    /// Whether a `connect` request should attach to this state instead of
    /// starting a new physical connection
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// Whether the state machine permits a transition from `self` to `next`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
