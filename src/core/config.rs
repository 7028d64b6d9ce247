use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::device::DEFAULT_BAUDRATE;
use crate::core::modbus::transports::{ControlLine, SerialSettings};
use crate::core::modbus::{EngineConfig, MODBUS_DEFAULT_TIMEOUT_MS, MODBUS_MAX_RETRY_ATTEMPTS};
use crate::core::scheduler::{PollingConfig, IDLE_BACKOFF_MS, REGISTER_SPACING_MS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub port: String,
    pub baudrate: u32,
    pub timeout_ms: u64,
    pub retry_attempts: u8,
    pub de_line: ControlLine,
    pub re_line: ControlLine,
    pub direction_active_high: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: DEFAULT_BAUDRATE,
            timeout_ms: MODBUS_DEFAULT_TIMEOUT_MS,
            retry_attempts: MODBUS_MAX_RETRY_ATTEMPTS,
            de_line: ControlLine::Rts,
            re_line: ControlLine::Dtr,
            direction_active_high: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub idle_backoff_ms: u64,
    pub register_spacing_ms: u64,
    /// Start the scheduler as soon as the bus is up.
    pub autostart: bool,
}

impl Default for PollingSection {
    fn default() -> Self {
        PollingSection {
            idle_backoff_ms: IDLE_BACKOFF_MS,
            register_spacing_ms: REGISTER_SPACING_MS,
            autostart: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        StoreSection {
            path: PathBuf::from("modbus_config.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub bus: BusConfig,
    pub polling: PollingSection,
    pub store: StoreSection,
}

impl SupervisorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<SupervisorConfig, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        SupervisorConfig::from_json(&bytes)
    }

    pub fn from_json(bytes: &[u8]) -> Result<SupervisorConfig, ConfigError> {
        let config: SupervisorConfig = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.retry_attempts == 0 {
            return Err(ConfigError::Invalid("bus.retry_attempts must be at least 1".into()));
        }

        if self.bus.baudrate == 0 {
            return Err(ConfigError::Invalid("bus.baudrate must be non-zero".into()));
        }

        if self.bus.timeout_ms == 0 {
            return Err(ConfigError::Invalid("bus.timeout_ms must be non-zero".into()));
        }

        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            timeout: Duration::from_millis(self.bus.timeout_ms),
            retry_attempts: self.bus.retry_attempts,
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig {
            idle_backoff: Duration::from_millis(self.polling.idle_backoff_ms),
            register_spacing: Duration::from_millis(self.polling.register_spacing_ms),
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.bus.port.clone(),
            baudrate: self.bus.baudrate,
            de_line: self.bus.de_line,
            re_line: self.bus.re_line,
            active_high: self.bus.direction_active_high,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_sections_take_defaults() {
        let config = SupervisorConfig::from_json(br#"{ "bus": { "port": "/dev/ttyS1" } }"#).unwrap();

        assert_eq!(config.bus.port, "/dev/ttyS1");
        assert_eq!(config.bus.baudrate, 9600);
        assert_eq!(config.bus.retry_attempts, 3);
        assert_eq!(config.bus.de_line, ControlLine::Rts);
        assert_eq!(config.bus.re_line, ControlLine::Dtr);
        assert_eq!(config.polling.register_spacing_ms, 10);
        assert!(config.polling.autostart);
        assert_eq!(config.engine_config().timeout, Duration::from_millis(1000));
    }

    #[test]
    fn control_lines_parse_lowercase() {
        let config = SupervisorConfig::from_json(
            br#"{ "bus": { "de_line": "dtr", "re_line": "none", "direction_active_high": false } }"#,
        )
        .unwrap();

        let serial = config.serial_settings();
        assert_eq!(serial.de_line, ControlLine::Dtr);
        assert_eq!(serial.re_line, ControlLine::None);
        assert!(!serial.active_high);
    }

    #[test]
    fn zero_retries_are_rejected() {
        let err = SupervisorConfig::from_json(br#"{ "bus": { "retry_attempts": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unreadable_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = SupervisorConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
