//! Bridge settings

use std::path::{Path, PathBuf};

use ble_mux::BridgeConfig;
use ble_sim::{VirtualCharacteristicConfig, VirtualPeripheralConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Environment variable overriding the settings file location
pub const SETTINGS_ENV: &str = "BLE_BRIDGE_SETTINGS";

/// Errors loading or saving settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine settings path")]
    NoPath,

    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Process settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Timing of the bridge core
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Peripherals exposed by the simulated radio
    #[serde(default)]
    pub peripherals: Vec<VirtualPeripheralConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            peripherals: vec![demo_heart_rate_monitor()],
        }
    }
}

/// Heart rate monitor that notifies once per second
fn demo_heart_rate_monitor() -> VirtualPeripheralConfig {
    let heart_rate_service = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
    let measurement = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
    let body_location = Uuid::from_u128(0x00002a38_0000_1000_8000_00805f9b34fb);

    VirtualPeripheralConfig {
        id: "C0:FF:EE:00:00:01".to_string(),
        name: Some("Virtual HRM".to_string()),
        services: vec![heart_rate_service],
        characteristics: vec![
            VirtualCharacteristicConfig {
                service: Some(heart_rate_service),
                value: vec![0x00, 72],
                writable: false,
                notify_interval_ms: Some(1000),
                ..VirtualCharacteristicConfig::notifying(measurement)
            },
            VirtualCharacteristicConfig {
                service: Some(heart_rate_service),
                uuid: body_location,
                value: vec![0x01],
                readable: true,
                writable: false,
                notify: false,
                notify_interval_ms: None,
            },
        ],
        ..Default::default()
    }
}

impl Settings {
    /// Get the config directory for the bridge
    /// Uses $XDG_CONFIG_HOME/ble-bridge when set, the platform config dir otherwise
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("ble-bridge"));
            }
        }

        dirs::config_dir().map(|p| p.join("ble-bridge"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(SETTINGS_ENV) {
            return Some(PathBuf::from(path));
        }
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings, falling back to defaults when the file is missing or invalid
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            warn!("Could not determine settings path, using defaults");
            return Self::default();
        };

        if !path.exists() {
            info!("No settings at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(settings) => {
                info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                warn!("Failed to load {}: {}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save settings to the settings path
    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoPath)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save settings to a specific file
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
