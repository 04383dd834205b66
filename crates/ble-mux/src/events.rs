//! Event streams emitted towards the host
//!
//! Four independent streams carry asynchronous activity: adapter status, scan
//! results, connection state updates and characteristic values. Each stream keeps its
//! own ordering and the streams are never interleaved. Every stream is
//! unbounded so emitting from inside the core never waits on the host.

use ble_protocol::{
    BleStatus, CharacteristicKey, ConnectionState, DeviceId, Failure, FailureKind, OperationResult, RadioError,
    ScanInfo,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// Activity of a running scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// A device advertisement was received
    Discovered {
        /// Advertisement contents
        info: ScanInfo,
    },
    /// The scan could not start or ended with a failure
    Failed {
        /// Failure category
        kind: FailureKind,
        /// Descriptive reason
        message: String,
    },
}

impl ScanEvent {
    /// Normalize a radio fault raised by the scan
    pub fn failed(error: RadioError) -> Self {
        ScanEvent::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// A connection state transition of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    /// Device whose state changed
    pub device_id: DeviceId,
    /// State entered
    pub state: ConnectionState,
    /// Why the device was disconnected, if it was not requested
    pub failure: Option<Failure>,
}

impl ConnectionUpdate {
    /// A transition without a failure
    pub fn new(device_id: DeviceId, state: ConnectionState) -> Self {
        Self {
            device_id,
            state,
            failure: None,
        }
    }

    /// A transition to `Disconnected` caused by a failure
    pub fn failed(device_id: DeviceId, failure: Failure) -> Self {
        Self {
            device_id,
            state: ConnectionState::Disconnected,
            failure: Some(failure),
        }
    }
}

/// A characteristic value (or failure) for the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicUpdate {
    /// Characteristic the value belongs to
    pub key: CharacteristicKey,
    /// Value or failure
    pub result: OperationResult<Vec<u8>>,
}

/// Sending side of the event streams
#[derive(Debug, Clone)]
pub struct EventSink {
    status_tx: mpsc::UnboundedSender<BleStatus>,
    scan_tx: mpsc::UnboundedSender<ScanEvent>,
    connection_tx: mpsc::UnboundedSender<ConnectionUpdate>,
    characteristic_tx: mpsc::UnboundedSender<CharacteristicUpdate>,
}

/// Receiving side of the event streams
#[derive(Debug)]
pub struct EventStreams {
    /// Adapter status changes
    pub status: mpsc::UnboundedReceiver<BleStatus>,
    /// Scan results
    pub scan: mpsc::UnboundedReceiver<ScanEvent>,
    /// Connection state updates
    pub connection: mpsc::UnboundedReceiver<ConnectionUpdate>,
    /// Characteristic values
    pub characteristic: mpsc::UnboundedReceiver<CharacteristicUpdate>,
}

/// Create a connected sink and stream set
pub fn event_channels() -> (EventSink, EventStreams) {
    let (status_tx, status) = mpsc::unbounded_channel();
    let (scan_tx, scan) = mpsc::unbounded_channel();
    let (connection_tx, connection) = mpsc::unbounded_channel();
    let (characteristic_tx, characteristic) = mpsc::unbounded_channel();

    (
        EventSink {
            status_tx,
            scan_tx,
            connection_tx,
            characteristic_tx,
        },
        EventStreams {
            status,
            scan,
            connection,
            characteristic,
        },
    )
}

// Emission never fails the core: if the host dropped a stream, events for it
// are discarded.
impl EventSink {
    pub fn status(&self, status: BleStatus) {
        trace!("Adapter status: {:?}", status);
        let _ = self.status_tx.send(status);
    }

    pub fn scan(&self, event: ScanEvent) {
        let _ = self.scan_tx.send(event);
    }

    pub fn connection(&self, update: ConnectionUpdate) {
        trace!(
            "Connection update: {} -> {}",
            update.device_id,
            update.state
        );
        let _ = self.connection_tx.send(update);
    }

    pub fn characteristic(&self, update: CharacteristicUpdate) {
        let _ = self.characteristic_tx.send(update);
    }
}
