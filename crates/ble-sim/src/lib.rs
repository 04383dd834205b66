//! BLE Simulation Library
//!
//! This crate provides a simulated radio for exercising the BLE bridge
//! without hardware. It includes:
//!
//! - **VirtualRadio**: implements the radio capability over a set of virtual
//!   peripherals, with scriptable answers and a log of every call received
//! - **VirtualPeripheralConfig**: serializable description of a peripheral and
//!   its characteristics
//!
//! # Example
//!
//! ```rust
//! use ble_protocol::{BleRadio, DeviceId};
//! use ble_sim::{characteristic_key, Behavior, VirtualCharacteristicConfig, VirtualPeripheralConfig, VirtualRadio};
//! use uuid::Uuid;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let radio = VirtualRadio::with_peripherals([VirtualPeripheralConfig {
//!     id: "thermometer".into(),
//!     characteristics: vec![VirtualCharacteristicConfig::notifying(Uuid::from_u128(0x2a1c))],
//!     ..Default::default()
//! }])
//! .unwrap();
//!
//! let device = DeviceId::from("thermometer");
//! let _link = radio.connect(&device, None).await.unwrap();
//!
//! // Make the next read of the temperature fail
//! let key = characteristic_key("thermometer", 0x2a1c);
//! radio
//!     .set_read_behavior(&key, Behavior::Fail(ble_protocol::RadioError::Rejected("busy".into())))
//!     .unwrap();
//! assert!(radio.read(&key).await.is_err());
//! assert_eq!(radio.calls().reads.len(), 1);
//! # }
//! ```

pub mod error;
pub mod peripheral;
pub mod radio;

pub use error::SimError;
pub use peripheral::{Behavior, VirtualCharacteristicConfig, VirtualPeripheralConfig, DEFAULT_MTU_LIMIT};
pub use radio::{characteristic_key, CallLog, VirtualRadio, WriteRecord};
