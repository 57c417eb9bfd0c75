//! # Configuration Management Module
//!
//! Loads, validates and persists the TOML configuration consumed by the notifier core.
//! The core only reads these values; the `arm`/`disarm` CLI commands are the single
//! place the file is written back.
//!
//! ## Configuration Structure
//!
//! - [`DeviceConfig`] - Armed flag and optional device id override
//! - [`BackendConfig`] - Sync endpoint, bearer token and request timeout
//! - [`LinkConfig`] - Indicator device port, retry bound and blink pattern
//! - [`PollConfig`] - Periodic health-check poll
//! - [`StorageConfig`] - Location of the local state database
//! - [`LoggingConfig`] - Logging level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pinotify::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("Indicator port: {}", config.link.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [device]
//! armed = true
//!
//! [backend]
//! endpoint = "https://example.appspot.com/_ah/api/pinotify_api/v1"
//! timeout_seconds = 10
//!
//! [link]
//! port = "/dev/rfcomm0"
//! baud_rate = 9600
//! send_attempts = 3
//! blink_on_seconds = 2
//! blink_off_seconds = 2
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

/// Upper bound for either half of a blink pattern; both fit in one nibble.
pub const MAX_BLINK_SECONDS: u8 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    pub backend: BackendConfig,
    pub link: LinkConfig,
    #[serde(default)]
    pub poll: PollConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    /// User-controlled start/stop. While false, syncing and blinking are silent no-ops.
    #[serde(default)]
    pub armed: bool,
    /// Overrides the generated device id sent with every sync request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the device API; `device_request` is appended.
    pub endpoint: String,
    /// Bearer token issued by the account collaborator, if the backend requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Serial device bound to the indicator (an RFCOMM tty for Bluetooth SPP).
    pub port: String,
    pub baud_rate: u32,
    /// Connect-and-write attempts per send before giving up.
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
    pub blink_on_seconds: u8,
    pub blink_off_seconds: u8,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Delay after raising DTR/RTS before the port is considered ready.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_send_attempts() -> u32 {
    3
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_settle_ms() -> u64 {
    150
}

impl LinkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 5,
        }
    }
}

impl PollConfig {
    /// Poll period, or `None` when the poll fallback is switched off.
    pub fn interval(&self) -> Option<Duration> {
        if self.enabled && self.interval_seconds > 0 {
            Some(Duration::from_secs(self.interval_seconds))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl StorageConfig {
    pub fn state_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("state")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        Config::default().save(path).await
    }

    /// Overwrite `path` with this configuration
    pub async fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.endpoint.trim().is_empty() {
            return Err(anyhow!("backend.endpoint must not be empty"));
        }
        if self.backend.timeout_seconds == 0 {
            return Err(anyhow!("backend.timeout_seconds must be at least 1"));
        }
        if self.link.send_attempts == 0 {
            return Err(anyhow!("link.send_attempts must be at least 1"));
        }
        if self.link.blink_on_seconds > MAX_BLINK_SECONDS
            || self.link.blink_off_seconds > MAX_BLINK_SECONDS
        {
            return Err(anyhow!(
                "blink durations must be within 0-{} seconds",
                MAX_BLINK_SECONDS
            ));
        }
        if self.link.blink_on_seconds == 0 && self.link.blink_off_seconds == 0 {
            return Err(anyhow!("blink_on_seconds and blink_off_seconds cannot both be 0"));
        }
        if self.poll.enabled && self.poll.interval_seconds == 0 {
            return Err(anyhow!("poll.interval_seconds must be at least 1 when polling is enabled"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig::default(),
            backend: BackendConfig {
                endpoint: "http://localhost:8080/_ah/api/pinotify_api/v1".to_string(),
                auth_token: None,
                timeout_seconds: default_timeout_seconds(),
            },
            link: LinkConfig {
                port: "/dev/rfcomm0".to_string(),
                baud_rate: 9600,
                send_attempts: default_send_attempts(),
                blink_on_seconds: 2,
                blink_off_seconds: 2,
                read_timeout_ms: default_read_timeout_ms(),
                settle_ms: default_settle_ms(),
            },
            poll: PollConfig::default(),
            storage: StorageConfig {
                data_dir: "./data".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("pinotify.log".to_string()),
            },
        }
    }
}

/// Runtime view of the Armed flag, shared by every component that must go quiet
/// when the user has stopped the notifier.
#[derive(Debug, Clone, Default)]
pub struct ArmedFlag(Arc<AtomicBool>);

impl ArmedFlag {
    pub fn new(armed: bool) -> Self {
        Self(Arc::new(AtomicBool::new(armed)))
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, armed: bool) {
        self.0.store(armed, Ordering::SeqCst);
    }
}
