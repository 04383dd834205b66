//! Value types exchanged with the radio and the host

use uuid::Uuid;

use crate::DeviceId;

/// Adapter status as reported by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BleStatus {
    /// Status not determined yet
    #[default]
    Unknown,
    /// The host has no BLE support
    Unsupported,
    /// The application lacks permission to use BLE
    Unauthorized,
    /// The adapter is switched off
    PoweredOff,
    /// Scanning requires location services which are disabled
    LocationServicesDisabled,
    /// The adapter is usable
    Ready,
}

/// Connection interval preference for an established link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionPriority {
    /// Platform default interval
    #[default]
    Balanced,
    /// Short interval, higher throughput and power draw
    HighPerformance,
    /// Long interval, lowest power draw
    LowPower,
}

/// How aggressively the radio scans for advertisements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanMode {
    /// Lowest duty cycle
    LowPower,
    /// Moderate duty cycle
    #[default]
    Balanced,
    /// Continuous scanning
    LowLatency,
    /// Only deliver results found by other scanners
    Opportunistic,
}

/// Parameters of a scan request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanFilter {
    /// Only report devices advertising one of these services (empty = all)
    #[cfg_attr(feature = "serde", serde(default))]
    pub services: Vec<Uuid>,
    /// Scan duty cycle
    #[cfg_attr(feature = "serde", serde(default))]
    pub scan_mode: ScanMode,
}

impl ScanFilter {
    /// Whether an advertisement passes this filter
    pub fn matches(&self, info: &ScanInfo) -> bool {
        self.services.is_empty() || self.services.iter().any(|s| info.services.contains(s))
    }
}

/// One advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanInfo {
    /// Advertising device
    pub device_id: DeviceId,
    /// Advertised local name
    pub name: Option<String>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Advertised service UUIDs
    #[cfg_attr(feature = "serde", serde(default))]
    pub services: Vec<Uuid>,
    /// Manufacturer specific data
    #[cfg_attr(feature = "serde", serde(default))]
    pub manufacturer_data: Vec<u8>,
}

/// Acknowledgement mode of a characteristic write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteType {
    /// The peripheral acknowledges the write
    WithResponse,
    /// Fire-and-forget write
    WithoutResponse,
}
