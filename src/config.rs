use std::collections::HashSet;
use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::error::{ConfigError, KEY_DELIMITER};

/// Fallback cycle period when the configured interval is missing or <= 0.
pub const DEFAULT_SCAN_INTERVAL_SECONDS: i64 = 15;

/// Reading reference used for devices that do not configure their own.
pub const DEFAULT_REFERENCE: &str = "presence";

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceConfig>,
    pub scan: Option<ScanConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

/// One tracked asset: the key telemetry is reported under, the hardware
/// address its presence is derived from, and the reading reference.
#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    pub key: String,
    pub address: MacAddress,
    pub reference: Option<String>,
}

impl DeviceConfig {
    pub fn reference(&self) -> &str {
        self.reference.as_deref().unwrap_or(DEFAULT_REFERENCE)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub interval_seconds: Option<i64>,
    /// Ask BlueZ to forget a matched device during the drain so it can
    /// re-trigger discovery in the next window.
    pub remove_matched_devices: Option<bool>,
}

impl AppConfig {
    /// Effective cycle period, applying the default when the configured
    /// value is absent or not a positive number of seconds.
    pub fn scan_interval(&self) -> Duration {
        let seconds = self
            .scan
            .as_ref()
            .and_then(|s| s.interval_seconds)
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_SCAN_INTERVAL_SECONDS);
        Duration::from_secs(seconds as u64)
    }

    pub fn remove_matched_devices(&self) -> bool {
        self.scan
            .as_ref()
            .and_then(|s| s.remove_matched_devices)
            .unwrap_or(false)
    }

    /// Startup validation. Any failure here is fatal; nothing else in the
    /// system is.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.key.is_empty() {
                return Err(ConfigError::EmptyDeviceKey);
            }
            if device.key.contains(KEY_DELIMITER) {
                return Err(ConfigError::ReservedDelimiter {
                    field: "device key",
                    value: device.key.clone(),
                });
            }
            if device.reference().contains(KEY_DELIMITER) {
                return Err(ConfigError::ReservedDelimiter {
                    field: "reference",
                    value: device.reference().to_string(),
                });
            }
            if !seen.insert(device.key.clone()) {
                return Err(ConfigError::DuplicateDeviceKey(device.key.clone()));
            }
        }

        Ok(())
    }
}
