// Configuration management for the blelink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blelink/config.json
// - Linux: ~/.config/blelink/config.json
// - Windows: %APPDATA%\blelink\config.json

use anyhow::{Context, Result};
use blelink_core::{PeripheralConfig, ScanConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Host adapter to use (e.g. `hci0`); first available when unset
    pub adapter: Option<String>,

    /// Central role settings
    pub scan: ScanConfig,

    /// Peripheral role settings
    pub peripheral: PeripheralConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blelink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value in memory after validating it
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "adapter" => {
                updated.adapter = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "scan_duration" => {
                updated.scan.duration_secs = if value.is_empty() || value == "none" {
                    None
                } else {
                    Some(value.parse().context("Invalid number of seconds")?)
                };
            }
            "device_name" => updated.peripheral.advertisement.device_name = value.to_string(),
            "model_number" => updated.peripheral.model_number = value.to_string(),
            "serial_number" => updated.peripheral.serial_number = value.to_string(),
            "battery_refresh_ms" => {
                updated.peripheral.battery_refresh_ms =
                    value.parse().context("Invalid number")?;
            }
            "connectable" => {
                updated.peripheral.advertisement.connectable =
                    value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        updated.scan.validate()?;
        updated.peripheral.validate()?;
        *self = updated;
        Ok(())
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "adapter" => self.adapter.clone(),
            "scan_duration" => self.scan.duration_secs.map(|s| s.to_string()),
            "device_name" => Some(self.peripheral.advertisement.device_name.clone()),
            "model_number" => Some(self.peripheral.model_number.clone()),
            "serial_number" => Some(self.peripheral.serial_number.clone()),
            "battery_refresh_ms" => Some(self.peripheral.battery_refresh_ms.to_string()),
            "connectable" => Some(self.peripheral.advertisement.connectable.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "adapter".to_string(),
                self.adapter.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "scan_duration".to_string(),
                self.scan
                    .duration_secs
                    .map(|s| format!("{}s", s))
                    .unwrap_or_else(|| "(until Ctrl-C)".to_string()),
            ),
            (
                "device_name".to_string(),
                self.peripheral.advertisement.device_name.clone(),
            ),
            ("model_number".to_string(), self.peripheral.model_number.clone()),
            ("serial_number".to_string(), self.peripheral.serial_number.clone()),
            (
                "battery_refresh_ms".to_string(),
                self.peripheral.battery_refresh_ms.to_string(),
            ),
            (
                "connectable".to_string(),
                self.peripheral.advertisement.connectable.to_string(),
            ),
        ]
    }
}
