//! Virtual peripheral definitions
//!
//! A virtual peripheral is a device the simulated radio can scan, connect to
//! and exchange characteristic values with. Peripherals are described by
//! serializable configs so they can be loaded from settings files.

use std::collections::HashMap;
use std::time::Duration;

use ble_protocol::{DeviceId, RadioError, ScanInfo};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default MTU ceiling of a virtual peripheral
pub const DEFAULT_MTU_LIMIT: u16 = 517;

/// How the simulated radio answers a given operation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Answer immediately
    #[default]
    Respond,
    /// Answer after a delay
    Delay(Duration),
    /// Fail with the given error
    Fail(RadioError),
    /// Never answer
    Hang,
}

/// Configuration of one characteristic on a virtual peripheral
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualCharacteristicConfig {
    /// Service the characteristic belongs to
    #[serde(default)]
    pub service: Option<Uuid>,
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Initial value
    #[serde(default)]
    pub value: Vec<u8>,
    /// Whether reads are permitted
    #[serde(default = "default_true")]
    pub readable: bool,
    /// Whether writes are permitted
    #[serde(default = "default_true")]
    pub writable: bool,
    /// Whether notifications are supported
    #[serde(default)]
    pub notify: bool,
    /// Emit the current value periodically while notifications are enabled
    #[serde(default)]
    pub notify_interval_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl VirtualCharacteristicConfig {
    /// A readable, writable characteristic that also notifies
    pub fn notifying(uuid: Uuid) -> Self {
        Self {
            service: None,
            uuid,
            value: Vec::new(),
            readable: true,
            writable: true,
            notify: true,
            notify_interval_ms: None,
        }
    }
}

/// Configuration for creating a virtual peripheral
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VirtualPeripheralConfig {
    /// Device identifier
    pub id: String,
    /// Advertised name
    #[serde(default)]
    pub name: Option<String>,
    /// Advertised signal strength
    #[serde(default = "default_rssi")]
    pub rssi: i16,
    /// Advertised services
    #[serde(default)]
    pub services: Vec<Uuid>,
    /// Characteristics exposed once connected
    #[serde(default)]
    pub characteristics: Vec<VirtualCharacteristicConfig>,
    /// Largest MTU the peripheral accepts
    #[serde(default = "default_mtu_limit")]
    pub mtu_limit: u16,
    /// Whether the stack supports clearing this device's GATT cache
    #[serde(default = "default_true")]
    pub supports_gatt_cache_clear: bool,
    /// Whether the stack supports connection priority requests
    #[serde(default = "default_true")]
    pub supports_connection_priority: bool,
}

fn default_rssi() -> i16 {
    -60
}

fn default_mtu_limit() -> u16 {
    DEFAULT_MTU_LIMIT
}

impl Default for VirtualPeripheralConfig {
    fn default() -> Self {
        Self {
            id: "00:00:00:00:00:01".to_string(),
            name: Some("Virtual Peripheral".to_string()),
            rssi: default_rssi(),
            services: Vec::new(),
            characteristics: Vec::new(),
            mtu_limit: DEFAULT_MTU_LIMIT,
            supports_gatt_cache_clear: true,
            supports_connection_priority: true,
        }
    }
}

/// Runtime state of one characteristic
#[derive(Debug, Clone)]
pub(crate) struct VirtualCharacteristic {
    pub config: VirtualCharacteristicConfig,
    pub value: Vec<u8>,
    pub read_behavior: Behavior,
    pub write_behavior: Behavior,
    pub setup_behavior: Behavior,
}

impl VirtualCharacteristic {
    fn from_config(config: VirtualCharacteristicConfig) -> Self {
        Self {
            value: config.value.clone(),
            config,
            read_behavior: Behavior::Respond,
            write_behavior: Behavior::Respond,
            setup_behavior: Behavior::Respond,
        }
    }
}

/// Runtime state of one virtual peripheral
#[derive(Debug, Clone)]
pub(crate) struct VirtualPeripheral {
    pub id: DeviceId,
    pub config: VirtualPeripheralConfig,
    pub characteristics: HashMap<Uuid, VirtualCharacteristic>,
    pub connect_behavior: Behavior,
    pub disconnect_behavior: Behavior,
    pub mtu: u16,
}

impl VirtualPeripheral {
    pub fn from_config(config: VirtualPeripheralConfig) -> Self {
        let characteristics = config
            .characteristics
            .iter()
            .cloned()
            .map(|c| (c.uuid, VirtualCharacteristic::from_config(c)))
            .collect();

        Self {
            id: DeviceId::new(config.id.clone()),
            config,
            characteristics,
            connect_behavior: Behavior::Respond,
            disconnect_behavior: Behavior::Respond,
            mtu: 23,
        }
    }

    pub fn scan_info(&self) -> ScanInfo {
        ScanInfo {
            device_id: self.id.clone(),
            name: self.config.name.clone(),
            rssi: self.config.rssi,
            services: self.config.services.clone(),
            manufacturer_data: Vec::new(),
        }
    }
}
