//! Bridge configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Timing configuration of the bridge core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Connection attempt deadline when the request does not carry one (ms)
    pub connect_timeout_ms: u64,
    /// Deadline of a single read, write, MTU or priority request (ms)
    pub operation_timeout_ms: u64,
    /// Deadline of notification setup and teardown on the radio (ms)
    pub notification_timeout_ms: u64,
    /// Capacity of the dispatcher command channel
    pub command_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 5_000,
            notification_timeout_ms: 5_000,
            command_buffer: 256,
        }
    }
}

impl BridgeConfig {
    /// Reject configurations the core cannot run with
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.connect_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.notification_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "notification_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(BridgeError::InvalidConfig(
                "command_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }
}
