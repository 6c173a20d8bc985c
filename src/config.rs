//! Configuration, paths and watchdog constants

use crate::error::{Error, Result};
use crate::heater::HeaterMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// All configurable paths and settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_port: u16,
    pub state_file: PathBuf,
    pub sms_incoming_dir: PathBuf,
    pub sms_outgoing_dir: PathBuf,
    pub modem_data_node: PathBuf,
    pub modem_control_node: PathBuf,
    pub network_interface: String,
    pub sms_daemon_process: String,
    pub pin: String,
    pub public_ip_url: String,
    pub log_unit: String,
    pub cycle_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_port: DEFAULT_DEVICE_PORT,
            state_file: PathBuf::from("/var/lib/heater_hub.state"),
            sms_incoming_dir: PathBuf::from("/var/spool/sms/incoming"),
            sms_outgoing_dir: PathBuf::from("/var/spool/sms/outgoing"),
            modem_data_node: PathBuf::from("/dev/ttyUSB2"),
            modem_control_node: PathBuf::from("/dev/ttyUSB3"),
            network_interface: "wlan0".to_string(),
            sms_daemon_process: "smsd".to_string(),
            pin: "1234".to_string(),
            public_ip_url: "https://ifconfig.me".to_string(),
            log_unit: "heater-hub.service".to_string(),
            cycle_interval_ms: 50,
        }
    }
}

impl Config {
    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            device_port: 0,
            state_file: temp_dir.join("state/heater_hub.state"),
            sms_incoming_dir: temp_dir.join("sms/incoming"),
            sms_outgoing_dir: temp_dir.join("sms/outgoing"),
            modem_data_node: temp_dir.join("ttyUSB2"),
            modem_control_node: temp_dir.join("ttyUSB3"),
            network_interface: "lo".to_string(),
            sms_daemon_process: "smsd".to_string(),
            pin: "1234".to_string(),
            public_ip_url: "http://127.0.0.1:9/".to_string(),
            log_unit: "heater-hub.service".to_string(),
            cycle_interval_ms: 10,
        }
    }

    /// Load overrides from a JSON file; absent fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        if config.pin.is_empty() || !config.pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Config(format!(
                "pin must be a non-empty string of digits in {}",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Default location of the optional override file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("heater-hub/config.json"))
    }
}

pub const DEFAULT_DEVICE_PORT: u16 = 32322;

/// Mode forced on every heater when the SMS path is judged dead
pub const FALLBACK_MODE: HeaterMode = HeaterMode::Defrost;

pub const LINK_CHECK_PERIOD: Duration = Duration::from_secs(60);
pub const LINK_FAILURE_THRESHOLD: u32 = 15;

pub const MODEM_CHECK_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const MODEM_FAILURE_THRESHOLD: u32 = 6;

pub const DAEMON_CHECK_PERIOD: Duration = Duration::from_secs(5 * 60);
pub const DAEMON_FAILURE_THRESHOLD: u32 = 6;

pub const STALE_SWEEP_PERIOD: Duration = Duration::from_secs(60);
pub const CONNECTION_MAX_IDLE: Duration = Duration::from_secs(30 * 60);

pub const LOST_SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);
pub const DEVICE_LOST_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

pub const BOOT_NOTICE_DELAY: Duration = Duration::from_secs(30);

/// Counter jump above which a device is assumed to have rebooted
pub const REBOOT_COUNTER_WINDOW: u64 = 3;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device_port, 32322);
        assert!(config.state_file.starts_with("/var/lib"));
        assert_eq!(config.network_interface, "wlan0");
    }

    #[test]
    fn test_test_config() {
        let temp = std::env::temp_dir();
        let config = Config::for_test(&temp);
        assert!(config.state_file.starts_with(&temp));
        assert!(config.sms_outgoing_dir.starts_with(&temp));
    }

    #[test]
    fn test_partial_override_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"device_port": 4000, "pin": "9876"}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.device_port, 4000);
        assert_eq!(config.pin, "9876");
        assert_eq!(config.network_interface, "wlan0");
    }

    #[test]
    fn test_override_file_rejects_bad_pin() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"pin": "abc"}"#).unwrap();

        assert!(matches!(Config::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_escalation_windows() {
        // 15 link checks a minute apart, 6 modem checks five minutes apart
        assert_eq!(LINK_CHECK_PERIOD * LINK_FAILURE_THRESHOLD, Duration::from_secs(15 * 60));
        assert_eq!(MODEM_CHECK_PERIOD * MODEM_FAILURE_THRESHOLD, Duration::from_secs(30 * 60));
    }
}
