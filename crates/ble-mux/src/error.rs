//! Error types for the bridge core
//!
//! Radio outcomes never surface here; they travel as
//! [`ble_protocol::OperationResult`] values. These errors cover the plumbing
//! between the host and the dispatcher.

use thiserror::Error;

/// Errors that can occur talking to the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The dispatcher has stopped
    #[error("bridge dispatcher is not running")]
    ActorStopped,

    /// The dispatcher dropped a request without answering it
    #[error("request {0} was dropped without a response")]
    ResponseDropped(&'static str),

    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
