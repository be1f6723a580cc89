//! Role configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::peripheral::advertise::AdvertisementConfig;

/// Longest device name a GAP Device Name characteristic may hold.
pub const MAX_DEVICE_NAME_LEN: usize = 248;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid device name: {0}")]
    InvalidDeviceName(String),
    #[error("Invalid device information: {0}")]
    InvalidDeviceInformation(String),
    #[error("Battery refresh interval must be greater than zero")]
    InvalidRefreshInterval,
    #[error("Scan duration must be greater than zero")]
    InvalidScanDuration,
}

/// Peripheral role configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralConfig {
    pub advertisement: AdvertisementConfig,
    /// Model Number String characteristic value
    pub model_number: String,
    /// Serial Number String characteristic value
    pub serial_number: String,
    /// Battery level refresh period in milliseconds
    pub battery_refresh_ms: u64,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            advertisement: AdvertisementConfig::default(),
            model_number: "1AB2".to_string(),
            serial_number: "1234".to_string(),
            battery_refresh_ms: 5_000,
        }
    }
}

impl PeripheralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.advertisement.device_name;
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidDeviceName("name is empty".to_string()));
        }
        if name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::InvalidDeviceName(format!(
                "{} bytes exceeds {}",
                name.len(),
                MAX_DEVICE_NAME_LEN
            )));
        }
        if self.model_number.is_empty() || self.serial_number.is_empty() {
            return Err(ConfigError::InvalidDeviceInformation(
                "model and serial number are required".to_string(),
            ));
        }
        if self.battery_refresh_ms == 0 {
            return Err(ConfigError::InvalidRefreshInterval);
        }
        Ok(())
    }

    pub fn battery_refresh(&self) -> Duration {
        Duration::from_millis(self.battery_refresh_ms)
    }
}

/// Central role configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Stop scanning after this many seconds; `None` scans until stopped.
    pub duration_secs: Option<u64>,
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration_secs == Some(0) {
            return Err(ConfigError::InvalidScanDuration);
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_config_default() {
        let config = PeripheralConfig::default();
        assert_eq!(config.advertisement.device_name, "MyDevice");
        assert_eq!(config.model_number, "1AB2");
        assert_eq!(config.serial_number, "1234");
        assert_eq!(config.battery_refresh(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_peripheral_config_validation() {
        let mut config = PeripheralConfig::default();
        config.advertisement.device_name = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDeviceName(_))
        ));

        config.advertisement.device_name = "x".repeat(MAX_DEVICE_NAME_LEN + 1);
        assert!(config.validate().is_err());

        let config = PeripheralConfig {
            battery_refresh_ms: 0,
            ..PeripheralConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidRefreshInterval));
    }

    #[test]
    fn test_scan_config_validation() {
        assert!(ScanConfig::default().validate().is_ok());
        assert_eq!(ScanConfig::default().duration(), None);

        let config = ScanConfig {
            duration_secs: Some(0),
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidScanDuration));

        let config = ScanConfig {
            duration_secs: Some(10),
        };
        assert_eq!(config.duration(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_peripheral_config_serde() {
        let config = PeripheralConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: PeripheralConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
