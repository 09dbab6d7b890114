// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of the FluxION Macropad Updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Configuration module for the updater

use crate::artifacts::ArtifactKind;
use crate::error::{Result, UpdaterError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "macropad-updater.json";

const DEFAULT_VERSION_URL: &str =
    "https://raw.githubusercontent.com/Archer2121/Macropad/main/version.txt";
const DEFAULT_FIRMWARE_BASE_URL: &str =
    "https://raw.githubusercontent.com/Archer2121/Macropad/main/main/build/esp32.esp32.lolin_s3";

/// Espressif USB vendor id reported by the S3's native USB-CDC port
pub const ESPRESSIF_VENDOR_ID: u16 = 0x303A;

fn default_chip() -> String {
    "esp32s3".to_owned()
}

fn default_flash_baud() -> u32 {
    460_800
}

fn default_serial_baud() -> u32 {
    115_200
}

fn default_version_url() -> String {
    DEFAULT_VERSION_URL.to_owned()
}

fn default_firmware_base_url() -> String {
    DEFAULT_FIRMWARE_BASE_URL.to_owned()
}

fn default_firmware_dir() -> PathBuf {
    PathBuf::from("firmware")
}

fn default_esptool() -> String {
    "esptool".to_owned()
}

fn default_5() -> u64 {
    5
}

fn default_20() -> u64 {
    20
}

fn default_60() -> u64 {
    60
}

fn default_vendor_id() -> u16 {
    ESPRESSIF_VENDOR_ID
}

fn default_port_hints() -> Vec<String> {
    vec!["esp32".to_owned(), "cdc".to_owned()]
}

fn default_scan_prefix() -> String {
    "192.168.1".to_owned()
}

fn default_scan_start() -> u8 {
    1
}

fn default_scan_end() -> u8 {
    254
}

fn default_probe_timeout_ms() -> u64 {
    300
}

fn default_mdns_host() -> Option<String> {
    Some("macropad.local".to_owned())
}

fn default_version_path() -> String {
    "/version".to_owned()
}

fn default_ota_path() -> String {
    "/ota".to_owned()
}

fn default_upload_path() -> String {
    "/update".to_owned()
}

fn default_serial_version_command() -> String {
    "/version".to_owned()
}

fn default_port_release_ms() -> u64 {
    500
}

fn default_monitor_reopen_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_artifacts() -> Vec<ArtifactSpec> {
    vec![
        ArtifactSpec::new(ArtifactKind::Bootloader, "bootloader.bin", "bootloader.bin"),
        ArtifactSpec::new(ArtifactKind::PartitionTable, "partitions.bin", "partitions.bin"),
        ArtifactSpec::new(ArtifactKind::BootSelector, "boot_app0.bin", "boot_app0.bin"),
        ArtifactSpec::new(ArtifactKind::Application, "main.ino.bin", "firmware.bin"),
    ]
}

/// File names for one artifact. The load offset is fixed by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub kind: ArtifactKind,
    /// File name under `firmware_base_url`
    pub remote_file: String,
    /// File name under `firmware_dir`
    pub local_file: String,
}

impl ArtifactSpec {
    pub fn new(kind: ArtifactKind, remote_file: &str, local_file: &str) -> Self {
        Self {
            kind,
            remote_file: remote_file.to_owned(),
            local_file: local_file.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Chip identifier passed to the flashing tool
    #[serde(default = "default_chip")]
    pub chip: String,

    #[serde(default = "default_flash_baud")]
    pub flash_baud: u32,

    /// Baud rate of the monitor / macro serial connection
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,

    /// Plain-text resource holding the latest firmware version
    #[serde(default = "default_version_url")]
    pub version_url: String,

    #[serde(default = "default_firmware_base_url")]
    pub firmware_base_url: String,

    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<ArtifactSpec>,

    /// Optional SHA256SUMS manifest covering the remote artifact files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksums_url: Option<String>,

    /// Local directory receiving downloaded artifacts and the state file
    #[serde(default = "default_firmware_dir")]
    pub firmware_dir: PathBuf,

    /// Flashing tool executable (name on PATH or absolute path)
    #[serde(default = "default_esptool")]
    pub esptool: String,

    /// Timeout for version and OTA requests (seconds)
    #[serde(default = "default_5")]
    pub http_timeout_secs: u64,

    /// Timeout for a single artifact download (seconds)
    #[serde(default = "default_20")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,

    /// Case-insensitive substrings identifying the device in port descriptions
    #[serde(default = "default_port_hints")]
    pub port_hints: Vec<String>,

    /// First three octets of the /24 scanned in network mode
    #[serde(default = "default_scan_prefix")]
    pub scan_prefix: String,

    #[serde(default = "default_scan_start")]
    pub scan_start: u8,

    #[serde(default = "default_scan_end")]
    pub scan_end: u8,

    /// Per-address probe timeout during the network scan (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Host name probed before the address range
    #[serde(default = "default_mdns_host")]
    pub mdns_host: Option<String>,

    #[serde(default = "default_version_path")]
    pub device_version_path: String,

    #[serde(default = "default_ota_path")]
    pub ota_arm_path: String,

    #[serde(default = "default_upload_path")]
    pub ota_upload_path: String,

    /// Line sent over serial to ask the device for its firmware version
    #[serde(default = "default_serial_version_command")]
    pub serial_version_command: String,

    /// Delay between closing the serial bridge and starting the flash tool
    #[serde(default = "default_port_release_ms")]
    pub port_release_delay_ms: u64,

    /// Delay between a successful flash and reopening the monitor
    #[serde(default = "default_monitor_reopen_ms")]
    pub monitor_reopen_delay_ms: u64,

    #[serde(default = "default_true")]
    pub reopen_monitor_after_flash: bool,

    /// Push the application image to the device after arming OTA
    #[serde(default)]
    pub ota_push: bool,

    /// How long to wait for the device to report the new version after a push
    #[serde(default = "default_60")]
    pub ota_confirm_timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            chip: default_chip(),
            flash_baud: default_flash_baud(),
            serial_baud: default_serial_baud(),
            version_url: default_version_url(),
            firmware_base_url: default_firmware_base_url(),
            artifacts: default_artifacts(),
            checksums_url: None,
            firmware_dir: default_firmware_dir(),
            esptool: default_esptool(),
            http_timeout_secs: 5,
            download_timeout_secs: 20,
            vendor_id: ESPRESSIF_VENDOR_ID,
            port_hints: default_port_hints(),
            scan_prefix: default_scan_prefix(),
            scan_start: 1,
            scan_end: 254,
            probe_timeout_ms: 300,
            mdns_host: default_mdns_host(),
            device_version_path: default_version_path(),
            ota_arm_path: default_ota_path(),
            ota_upload_path: default_upload_path(),
            serial_version_command: default_serial_version_command(),
            port_release_delay_ms: 500,
            monitor_reopen_delay_ms: 2000,
            reopen_monitor_after_flash: true,
            ota_push: false,
            ota_confirm_timeout_secs: 60,
        }
    }
}

impl UpdaterConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn port_release_delay(&self) -> Duration {
        Duration::from_millis(self.port_release_delay_ms)
    }

    pub fn monitor_reopen_delay(&self) -> Duration {
        Duration::from_millis(self.monitor_reopen_delay_ms)
    }

    pub fn state_path(&self) -> PathBuf {
        self.firmware_dir.join("updater_state.json")
    }

    /// Apply `MACROPAD_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(chip) = lookup("MACROPAD_CHIP") {
            self.chip = chip;
        }
        if let Some(baud) = lookup("MACROPAD_FLASH_BAUD") {
            self.flash_baud = parse_env("MACROPAD_FLASH_BAUD", &baud)?;
        }
        if let Some(baud) = lookup("MACROPAD_SERIAL_BAUD") {
            self.serial_baud = parse_env("MACROPAD_SERIAL_BAUD", &baud)?;
        }
        if let Some(url) = lookup("MACROPAD_VERSION_URL") {
            self.version_url = url;
        }
        if let Some(url) = lookup("MACROPAD_FIRMWARE_BASE_URL") {
            self.firmware_base_url = url;
        }
        if let Some(dir) = lookup("MACROPAD_FIRMWARE_DIR") {
            self.firmware_dir = PathBuf::from(dir);
        }
        if let Some(tool) = lookup("MACROPAD_ESPTOOL") {
            self.esptool = tool;
        }
        Ok(())
    }

    /// Reject configurations that would flash an incomplete or reordered image
    pub fn validate(&self) -> Result<()> {
        for kind in ArtifactKind::ALL {
            let count = self.artifacts.iter().filter(|a| a.kind == kind).count();
            if count != 1 {
                return Err(UpdaterError::Config(format!(
                    "artifact table must contain {kind} exactly once (found {count})"
                )));
            }
        }
        if self.artifacts.len() != ArtifactKind::ALL.len() {
            return Err(UpdaterError::Config(format!(
                "artifact table must contain exactly {} entries",
                ArtifactKind::ALL.len()
            )));
        }
        if let Some(empty) = self
            .artifacts
            .iter()
            .find(|a| a.remote_file.is_empty() || a.local_file.is_empty())
        {
            return Err(UpdaterError::Config(format!(
                "artifact {} has an empty file name",
                empty.kind
            )));
        }
        if self.scan_start == 0 || self.scan_start > self.scan_end {
            return Err(UpdaterError::Config(format!(
                "invalid scan range {}..={}",
                self.scan_start, self.scan_end
            )));
        }
        if self.http_timeout_secs == 0 || self.http_timeout_secs > 9 {
            return Err(UpdaterError::Config(format!(
                "http_timeout_secs must be between 1 and 9, got {}",
                self.http_timeout_secs
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| UpdaterError::Config(format!("invalid value for {key}: {value}")))
}

/// Load the config file, creating it with defaults if missing, then apply env overrides
pub fn load_config(path: &Path) -> Result<UpdaterConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| UpdaterError::Config(format!("Failed to parse config: {e}")))?
    } else {
        let config = UpdaterConfig::default();
        save_config(path, &config)?;
        config
    };

    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &UpdaterConfig) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(config)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = UpdaterConfig::default();
        assert_eq!(config.chip, "esp32s3");
        assert_eq!(config.flash_baud, 460_800);
        assert_eq!(config.serial_baud, 115_200);
        assert_eq!(config.vendor_id, 0x303A);
        assert_eq!(config.artifacts.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: UpdaterConfig = serde_json::from_str(r#"{"chip": "esp32"}"#).unwrap();
        assert_eq!(config.chip, "esp32");
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.mdns_host.as_deref(), Some("macropad.local"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MACROPAD_CHIP", "esp32"),
            ("MACROPAD_FLASH_BAUD", "921600"),
            ("MACROPAD_FIRMWARE_DIR", "/tmp/fw"),
        ]);
        let mut config = UpdaterConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| (*v).to_owned()))
            .unwrap();

        assert_eq!(config.chip, "esp32");
        assert_eq!(config.flash_baud, 921_600);
        assert_eq!(config.firmware_dir, PathBuf::from("/tmp/fw"));
        assert_eq!(config.serial_baud, 115_200);
    }

    #[test]
    fn test_env_override_rejects_bad_number() {
        let mut config = UpdaterConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == "MACROPAD_SERIAL_BAUD").then(|| "fast".to_owned())
        });
        assert!(matches!(result, Err(UpdaterError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_incomplete_artifact_table() {
        let mut config = UpdaterConfig::default();
        config.artifacts.pop();
        assert!(matches!(config.validate(), Err(UpdaterError::Config(_))));

        let mut config = UpdaterConfig::default();
        config.artifacts[1].kind = ArtifactKind::Bootloader;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_slow_timeout() {
        let config = UpdaterConfig {
            http_timeout_secs: 30,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updater.json");

        let config = load_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.artifacts, default_artifacts());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updater.json");
        let config = UpdaterConfig {
            chip: "esp32".to_owned(),
            ota_push: true,
            scan_prefix: "10.0.0".to_owned(),
            ..Default::default()
        };

        save_config(&path, &config).unwrap();
        let loaded: UpdaterConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.chip, "esp32");
        assert!(loaded.ota_push);
        assert_eq!(loaded.scan_prefix, "10.0.0");
    }
}
