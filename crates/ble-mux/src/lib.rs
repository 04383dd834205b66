//! BLE Bridge Core
//!
//! This crate provides the connection and notification multiplexing core that
//! sits between a host application and a BLE radio stack.
//!
//! # Architecture
//!
//! - **ConnectionRegistry**: per-device connection state machine, at most one
//!   physical connection per device
//! - **NotificationMultiplexer**: one underlying notification channel per
//!   characteristic, shared by any number of listeners
//! - **Operations**: reads, queued writes, MTU and connection priority
//!   requests scoped to a connected device
//! - **Scanner**: forwards advertisements of the running scan
//! - **Actor**: dispatches [`ble_protocol::BleRequest`]s and answers each with
//!   one [`ble_protocol::BleResponse`]
//!
//! Asynchronous activity reaches the host through three independent event
//! streams (scan, connection, characteristic); see [`events`].
//!
//! Every outcome the radio reports is normalized into an
//! [`ble_protocol::OperationResult`]. Nothing in the core panics or returns a
//! raw radio error to the host.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ble_mux::{BleBridge, BridgeConfig, BridgeHandle};
//! use ble_protocol::{BleRequest, DeviceId};
//! use ble_sim::{VirtualPeripheralConfig, VirtualRadio};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let radio = VirtualRadio::with_peripherals([VirtualPeripheralConfig::default()])?;
//! let (bridge, mut events) = BleBridge::new(Arc::new(radio), BridgeConfig::default())?;
//! let (handle, _task) = BridgeHandle::spawn(bridge);
//!
//! handle
//!     .request(BleRequest::ConnectToDevice {
//!         device_id: DeviceId::from("00:00:00:00:00:01"),
//!         timeout_ms: Some(5_000),
//!     })
//!     .await?;
//!
//! while let Some(update) = events.connection.recv().await {
//!     println!("{} is {}", update.device_id, update.state);
//! }
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod notify;
pub mod operations;
pub mod registry;
mod queue;
pub mod scan;
pub mod status;

// Re-export actor types
pub use actor::{run_bridge_actor, BridgeCommand, BridgeHandle};

pub use bridge::BleBridge;
pub use config::BridgeConfig;
pub use error::BridgeError;

// Re-export event types
pub use events::{
    event_channels, CharacteristicUpdate, ConnectionUpdate, EventSink, EventStreams, ScanEvent,
};

pub use notify::{NotificationMultiplexer, Subscription, SubscriptionHandle, SubscriptionId};
pub use operations::Operations;
pub use registry::ConnectionRegistry;
pub use scan::Scanner;
