//! Requests from the host application and their responses
//!
//! Every request kind the host can issue is a variant of [`BleRequest`], so
//! the dispatcher handles them with one exhaustive `match`. Each request is
//! answered by exactly one [`BleResponse`].

use crate::error::OperationResult;
use crate::models::{BleStatus, ConnectionPriority, ScanFilter, WriteType};
use crate::{CharacteristicKey, DeviceId};

/// A decoded request from the host application
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "method", rename_all = "snake_case"))]
pub enum BleRequest {
    /// Reset the bridge, tearing down connections left over from a previous session
    Initialize,
    /// Stop scanning and disconnect every device
    Deinitialize,
    /// Query the adapter status
    Status,
    /// Start a scan; results arrive on the scan event stream
    ScanForDevices {
        /// Scan parameters
        #[cfg_attr(feature = "serde", serde(default))]
        filter: ScanFilter,
    },
    /// Stop the running scan
    StopScan,
    /// Connect to a device; progress arrives on the connection event stream
    ConnectToDevice {
        /// Device to connect to
        device_id: DeviceId,
        /// Connection attempt deadline in milliseconds
        #[cfg_attr(feature = "serde", serde(default))]
        timeout_ms: Option<u64>,
    },
    /// Disconnect from a device
    DisconnectFromDevice {
        /// Device to disconnect from
        device_id: DeviceId,
    },
    /// Drop the cached GATT database of a device
    ClearGattCache {
        /// Target device
        device_id: DeviceId,
    },
    /// Read a characteristic once
    ReadCharacteristic {
        /// Characteristic to read
        characteristic: CharacteristicKey,
    },
    /// Write a characteristic
    WriteCharacteristic {
        /// Characteristic to write
        characteristic: CharacteristicKey,
        /// Bytes to write
        value: Vec<u8>,
        /// Acknowledged or unacknowledged write
        write_type: WriteType,
    },
    /// Subscribe to notifications; values arrive on the characteristic event stream
    ReadNotifications {
        /// Characteristic to subscribe to
        characteristic: CharacteristicKey,
    },
    /// Stop notifications started with `ReadNotifications`
    StopNotifications {
        /// Characteristic to unsubscribe from
        characteristic: CharacteristicKey,
    },
    /// Negotiate the MTU of an established link
    NegotiateMtuSize {
        /// Target device
        device_id: DeviceId,
        /// Requested MTU in bytes
        mtu_size: u16,
    },
    /// Change the connection interval preference of an established link
    RequestConnectionPriority {
        /// Target device
        device_id: DeviceId,
        /// Requested priority
        priority: ConnectionPriority,
    },
}

impl BleRequest {
    /// Returns the method name of the request (for logging)
    pub fn name(&self) -> &'static str {
        match self {
            BleRequest::Initialize => "initialize",
            BleRequest::Deinitialize => "deinitialize",
            BleRequest::Status => "status",
            BleRequest::ScanForDevices { .. } => "scanForDevices",
            BleRequest::StopScan => "stopScan",
            BleRequest::ConnectToDevice { .. } => "connectToDevice",
            BleRequest::DisconnectFromDevice { .. } => "disconnectFromDevice",
            BleRequest::ClearGattCache { .. } => "clearGattCache",
            BleRequest::ReadCharacteristic { .. } => "readCharacteristic",
            BleRequest::WriteCharacteristic {
                write_type: WriteType::WithResponse,
                ..
            } => "writeCharacteristicWithResponse",
            BleRequest::WriteCharacteristic {
                write_type: WriteType::WithoutResponse,
                ..
            } => "writeCharacteristicWithoutResponse",
            BleRequest::ReadNotifications { .. } => "readNotifications",
            BleRequest::StopNotifications { .. } => "stopNotifications",
            BleRequest::NegotiateMtuSize { .. } => "negotiateMtuSize",
            BleRequest::RequestConnectionPriority { .. } => "requestConnectionPriority",
        }
    }

    /// Get the device this request is scoped to (if any)
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            BleRequest::ConnectToDevice { device_id, .. }
            | BleRequest::DisconnectFromDevice { device_id }
            | BleRequest::ClearGattCache { device_id }
            | BleRequest::NegotiateMtuSize { device_id, .. }
            | BleRequest::RequestConnectionPriority { device_id, .. } => Some(device_id),
            BleRequest::ReadCharacteristic { characteristic }
            | BleRequest::WriteCharacteristic { characteristic, .. }
            | BleRequest::ReadNotifications { characteristic }
            | BleRequest::StopNotifications { characteristic } => Some(&characteristic.device_id),
            BleRequest::Initialize
            | BleRequest::Deinitialize
            | BleRequest::Status
            | BleRequest::ScanForDevices { .. }
            | BleRequest::StopScan => None,
        }
    }
}

/// How a connect request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectOutcome {
    /// A new physical connection attempt was started
    Started,
    /// The device was already connecting or connected; nothing new was started
    Attached,
}

/// The single answer to a [`BleRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "response", rename_all = "snake_case"))]
pub enum BleResponse {
    /// Completion of a request without payload
    Done {
        /// Outcome
        result: OperationResult<()>,
    },
    /// Adapter status
    Status {
        /// Current status
        status: BleStatus,
    },
    /// Outcome of a connect request
    Connection {
        /// Device the request was for
        device_id: DeviceId,
        /// Whether a connection was started or attached to
        result: OperationResult<ConnectOutcome>,
    },
    /// Outcome of a GATT cache clear
    GattCacheCleared {
        /// Target device
        device_id: DeviceId,
        /// Outcome
        result: OperationResult<()>,
    },
    /// Outcome of a characteristic read
    Value {
        /// Characteristic that was read
        characteristic: CharacteristicKey,
        /// Value or failure
        result: OperationResult<Vec<u8>>,
    },
    /// Outcome of a characteristic write
    Written {
        /// Characteristic that was written
        characteristic: CharacteristicKey,
        /// Outcome
        result: OperationResult<()>,
    },
    /// Outcome of a notification subscribe or unsubscribe
    Notifications {
        /// Characteristic concerned
        characteristic: CharacteristicKey,
        /// Outcome
        result: OperationResult<()>,
    },
    /// Outcome of an MTU negotiation
    Mtu {
        /// Target device
        device_id: DeviceId,
        /// Negotiated MTU or failure
        result: OperationResult<u16>,
    },
    /// Outcome of a connection priority change
    ConnectionPriority {
        /// Target device
        device_id: DeviceId,
        /// Outcome
        result: OperationResult<()>,
    },
}

impl BleResponse {
    /// Shorthand for a successful payload-less completion
    pub fn done() -> Self {
        BleResponse::Done { result: Ok(()) }
    }

    /// Whether the response reports a failure
    pub fn is_failure(&self) -> bool {
        match self {
            BleResponse::Done { result }
            | BleResponse::GattCacheCleared { result, .. }
            | BleResponse::Written { result, .. }
            | BleResponse::Notifications { result, .. }
            | BleResponse::ConnectionPriority { result, .. } => result.is_err(),
            BleResponse::Connection { result, .. } => result.is_err(),
            BleResponse::Value { result, .. } => result.is_err(),
            BleResponse::Mtu { result, .. } => result.is_err(),
            BleResponse::Status { .. } => false,
        }
    }
}
