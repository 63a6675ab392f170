//! Configuration using Figment
//!
//! Strongly-typed settings for discovery and logging. Configuration is loaded from:
//! 1. `config/spectrolink.toml` (base configuration)
//! 2. Environment variables prefixed with `SPECTROLINK_`, nested with `__`
//!    (e.g. `SPECTROLINK_USB__WARMUP_POLLS=3`)
//!
//! Every section and field has a default, so an empty or missing file is valid.
//!
//! # Example
//! ```no_run
//! use spectrolink::config::LinkConfig;
//!
//! let config = LinkConfig::load()?;
//! config.validate()?;
//! println!("warm-up polls: {}", config.usb.warmup_polls);
//! # Ok::<(), spectrolink::LinkError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::discovery::ble::{DEFAULT_NAME_PREFIX, SPECTROMETER_SERVICE};
use crate::discovery::{Platform, TcpEndpoint, UsbAllowList};
use crate::error::{LinkError, LinkResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/spectrolink.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SPECTROLINK_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// USB discovery settings
    #[serde(default)]
    pub usb: UsbConfig,
    /// BLE discovery settings
    #[serde(default)]
    pub ble: BleConfig,
    /// Watch directories for virtual spectrometers
    #[serde(default)]
    pub virtual_dirs: Vec<PathBuf>,
    /// Network spectrometers reachable at fixed addresses
    #[serde(default)]
    pub tcp_devices: Vec<TcpEndpoint>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// USB discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbConfig {
    /// Accepted vendor/product ids
    #[serde(default)]
    pub allow_list: UsbAllowList,
    /// Polling calls before switching to hotplug monitoring
    #[serde(default = "default_warmup_polls")]
    pub warmup_polls: u32,
    /// Switch to hotplug monitoring after warm-up
    #[serde(default = "default_true")]
    pub continuous_monitoring: bool,
    /// Platform override; the host platform when unset
    #[serde(default)]
    pub platform: Option<Platform>,
    /// Hotplug wait per tick in microseconds
    #[serde(default = "default_event_timeout_us")]
    pub event_timeout_us: u64,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            allow_list: UsbAllowList::default(),
            warmup_polls: default_warmup_polls(),
            continuous_monitoring: true,
            platform: None,
            event_timeout_us: default_event_timeout_us(),
        }
    }
}

impl UsbConfig {
    /// Hotplug wait per tick.
    pub fn event_timeout(&self) -> Duration {
        Duration::from_micros(self.event_timeout_us)
    }
}

/// BLE discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleConfig {
    /// Scan budget in seconds
    #[serde(default = "default_ble_timeout")]
    pub timeout_secs: u64,
    /// Service UUID to match
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    /// Local-name prefix to match when no services are advertised
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Capacity of the discovery event channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_ble_timeout(),
            service_uuid: default_service_uuid(),
            name_prefix: default_name_prefix(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl BleConfig {
    /// Scan budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Default value functions
fn default_name() -> String {
    "spectrolink".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_warmup_polls() -> u32 {
    crate::discovery::usb::DEFAULT_WARMUP_POLLS
}

fn default_true() -> bool {
    true
}

fn default_event_timeout_us() -> u64 {
    500
}

fn default_ble_timeout() -> u64 {
    30
}

fn default_service_uuid() -> Uuid {
    SPECTROMETER_SERVICE
}

fn default_name_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_string()
}

fn default_channel_capacity() -> usize {
    32
}

impl LinkConfig {
    /// Load configuration from `config/spectrolink.toml` and environment variables
    ///
    /// Example override: `SPECTROLINK_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> LinkResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> LinkResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> LinkResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(LinkError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.usb.allow_list.is_empty() {
            return Err(LinkError::Configuration(
                "usb.allow_list must list at least one vendor/product".into(),
            ));
        }

        if self.ble.timeout_secs == 0 {
            return Err(LinkError::Configuration(
                "ble.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.ble.channel_capacity == 0 {
            return Err(LinkError::Configuration(
                "ble.channel_capacity must be greater than 0".into(),
            ));
        }

        let mut dirs = std::collections::HashSet::new();
        for dir in &self.virtual_dirs {
            if !dirs.insert(dir) {
                return Err(LinkError::Configuration(format!(
                    "Duplicate virtual directory: {}",
                    dir.display()
                )));
            }
        }

        let mut endpoints = std::collections::HashSet::new();
        for ep in &self.tcp_devices {
            if ep.port == 0 {
                return Err(LinkError::Configuration(format!(
                    "tcp_devices entry '{}' needs a non-zero port",
                    ep.address
                )));
            }
            if !endpoints.insert(ep) {
                return Err(LinkError::Configuration(format!(
                    "Duplicate tcp device: {}:{}",
                    ep.address, ep.port
                )));
            }
        }

        Ok(())
    }

    /// Platform to use for USB monitoring: the override, or the host.
    pub fn platform(&self) -> Platform {
        self.usb.platform.unwrap_or_else(Platform::host)
    }
}
