//! Failure types shared by the bridge core and the radio capability

use thiserror::Error;

use crate::{CharacteristicKey, DeviceId};

/// Result of any bridge operation
///
/// `Ok` is the success payload, `Err` the normalized failure. Nothing else
/// crosses the boundary to the host application.
pub type OperationResult<T> = Result<T, Failure>;

/// Category of a failure reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureKind {
    /// Timeout, link drop, unreachable peripheral or disconnection while pending
    ConnectionFailure,
    /// The platform or radio stack lacks the capability
    UnsupportedOperation,
    /// The radio explicitly refused the request (invalid characteristic,
    /// write not permitted, ...)
    OperationRejected,
    /// Uncategorized fault raised by the radio stack
    TransportFault,
}

impl FailureKind {
    /// Returns a human-readable name for the kind
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::ConnectionFailure => "connection failure",
            FailureKind::UnsupportedOperation => "unsupported operation",
            FailureKind::OperationRejected => "operation rejected",
            FailureKind::TransportFault => "transport fault",
        }
    }
}

/// A failure as delivered to the host application
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("{} on {device_id}: {message}", .kind.name())]
pub struct Failure {
    /// Failure category
    pub kind: FailureKind,
    /// Descriptive reason
    pub message: String,
    /// Device the failed operation was scoped to
    pub device_id: DeviceId,
    /// Characteristic the failed operation was scoped to (if any)
    #[cfg_attr(feature = "serde", serde(default))]
    pub characteristic: Option<CharacteristicKey>,
}

impl Failure {
    /// Create a failure scoped to a device
    pub fn new(kind: FailureKind, device_id: &DeviceId, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            device_id: device_id.clone(),
            characteristic: None,
        }
    }

    /// Create a failure scoped to a characteristic
    pub fn for_characteristic(
        kind: FailureKind,
        key: &CharacteristicKey,
        message: impl Into<String>,
    ) -> Self {
        Self::new(kind, &key.device_id, message).with_characteristic(key.clone())
    }

    /// Attach the characteristic the failure belongs to
    pub fn with_characteristic(mut self, key: CharacteristicKey) -> Self {
        self.characteristic = Some(key);
        self
    }

    /// Failure reported when an operation requires a connected device
    pub fn not_connected(device_id: &DeviceId) -> Self {
        Self::new(
            FailureKind::ConnectionFailure,
            device_id,
            format!("device {} is not connected", device_id),
        )
    }

    /// Failure reported to work that was pending when its device disconnected
    pub fn disconnected(device_id: &DeviceId) -> Self {
        Self::new(
            FailureKind::ConnectionFailure,
            device_id,
            format!("device {} disconnected", device_id),
        )
    }

    /// Normalize an error raised by the radio capability
    pub fn from_radio(error: RadioError, device_id: &DeviceId) -> Self {
        Self::new(error.kind(), device_id, error.to_string())
    }
}

/// Fault value reported by the radio capability
///
/// Every radio operation reports failures through this type instead of
/// panicking or silently dropping data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    /// The radio refused the request
    #[error("rejected: {0}")]
    Rejected(String),

    /// The platform does not provide this capability
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The radio did not answer in time
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The link to the peripheral went away
    #[error("link lost: {0}")]
    Disconnected(String),

    /// The peripheral could not be reached
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Any other radio stack fault
    #[error("radio fault: {0}")]
    Fault(String),
}

impl RadioError {
    /// Map the radio fault onto the host failure taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            RadioError::Rejected(_) => FailureKind::OperationRejected,
            RadioError::Unsupported(_) => FailureKind::UnsupportedOperation,
            RadioError::Timeout(_) | RadioError::Disconnected(_) | RadioError::Unreachable(_) => {
                FailureKind::ConnectionFailure
            }
            RadioError::Fault(_) => FailureKind::TransportFault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    #[test]
    fn test_radio_error_mapping() {
        assert_eq!(
            RadioError::Rejected("x".into()).kind(),
            FailureKind::OperationRejected
        );
        assert_eq!(
            RadioError::Unsupported("x".into()).kind(),
            FailureKind::UnsupportedOperation
        );
        assert_eq!(RadioError::Timeout(10).kind(), FailureKind::ConnectionFailure);
        assert_eq!(
            RadioError::Disconnected("x".into()).kind(),
            FailureKind::ConnectionFailure
        );
        assert_eq!(
            RadioError::Fault("x".into()).kind(),
            FailureKind::TransportFault
        );
    }

    #[test]
    fn test_failure_display() {
        let device = DeviceId::from("A");
        let failure = Failure::not_connected(&device);
        assert_eq!(
            failure.to_string(),
            "connection failure on A: device A is not connected"
        );
    }

    #[test]
    fn test_characteristic_failure_carries_key() {
        let key = CharacteristicKey::new(DeviceId::from("A"), Uuid::nil());
        let failure =
            Failure::for_characteristic(FailureKind::OperationRejected, &key, "not writable");
        assert_eq!(failure.device_id, key.device_id);
        assert_eq!(failure.characteristic, Some(key));
    }

    fn radio_error() -> impl Strategy<Value = RadioError> {
        prop_oneof![
            ".*".prop_map(RadioError::Rejected),
            ".*".prop_map(RadioError::Unsupported),
            any::<u64>().prop_map(RadioError::Timeout),
            ".*".prop_map(RadioError::Disconnected),
            ".*".prop_map(RadioError::Unreachable),
            ".*".prop_map(RadioError::Fault),
        ]
    }

    proptest! {
        #[test]
        fn radio_errors_always_normalize_with_device(err in radio_error(), id in "[A-F0-9:]{1,17}") {
            let device = DeviceId::new(id);
            let kind = err.kind();
            let failure = Failure::from_radio(err, &device);
            prop_assert_eq!(failure.kind, kind);
            prop_assert_eq!(failure.device_id, device);
            prop_assert!(failure.characteristic.is_none());
        }
    }
}
