//! Error types for the simulation layer

use ble_protocol::{CharacteristicKey, DeviceId};
use thiserror::Error;

/// Errors raised while scripting the virtual radio
#[derive(Debug, Error)]
pub enum SimError {
    /// No peripheral with this identifier
    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(DeviceId),

    /// No characteristic with this key
    #[error("unknown characteristic: {0}")]
    UnknownCharacteristic(CharacteristicKey),

    /// A peripheral with this identifier already exists
    #[error("peripheral already exists: {0}")]
    DuplicatePeripheral(DeviceId),
}
