//! Daemon configuration
//!
//! Loaded from a TOML file (missing file means defaults) and then
//! overridden by command line flags in `main`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::device::{DirectoryDeviceConfig, DEFAULT_SERVICE};

use crate::mount::{CacheSettings, ControllerOptions, DetachPolicy, FailurePolicy, MountSettings};

pub const APP_NAME: &str = "iphonedisk";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Upper bound for `unmount_timeout_secs`
pub const MAX_UNMOUNT_TIMEOUT_SECS: u64 = 3_600;
/// Upper bound for either retry backoff value
pub const MAX_BACKOFF_MS: u64 = 3_600_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Directory for a daily rotated log file, in addition to stderr
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mount_point: PathBuf,
    /// Service identifier opened on the device
    pub service: String,
    /// Local path standing in for the device's storage while attached
    pub device_path: PathBuf,
    pub poll_interval_ms: u64,
    pub volume_name: String,
    pub volume_icon: Option<PathBuf>,
    pub debug: bool,
    pub defer_auth: bool,
    pub read_only: bool,
    pub cache: CacheSettings,
    pub failure_policy: FailurePolicy,
    pub detach_policy: DetachPolicy,
    pub unmount_timeout_secs: u64,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            service: DEFAULT_SERVICE.to_string(),
            device_path: default_device_path(),
            poll_interval_ms: 500,
            volume_name: "iPhone".to_string(),
            volume_icon: Some(PathBuf::from("./iPhoneDisk.icns")),
            debug: cfg!(debug_assertions),
            defer_auth: true,
            read_only: false,
            cache: CacheSettings::default(),
            failure_policy: FailurePolicy::default(),
            detach_policy: DetachPolicy::default(),
            unmount_timeout_secs: 10,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load `path`, or the default location when `None`.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.trim().is_empty() {
            return Err(ConfigError::Invalid("service must not be empty".to_string()));
        }
        if self.mount_point.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "mount_point must not be empty".to_string(),
            ));
        }
        if !self.device_path.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "device_path must be absolute: {}",
                self.device_path.display()
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.unmount_timeout_secs > MAX_UNMOUNT_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "unmount_timeout_secs must be at most {}",
                MAX_UNMOUNT_TIMEOUT_SECS
            )));
        }
        if let FailurePolicy::Retry {
            initial_backoff_ms,
            max_backoff_ms,
        } = self.failure_policy
        {
            if initial_backoff_ms == 0 {
                return Err(ConfigError::Invalid(
                    "initial_backoff_ms must be greater than zero".to_string(),
                ));
            }
            if initial_backoff_ms > MAX_BACKOFF_MS || max_backoff_ms > MAX_BACKOFF_MS {
                return Err(ConfigError::Invalid(format!(
                    "retry backoff must be at most {} ms",
                    MAX_BACKOFF_MS
                )));
            }
        }
        Ok(())
    }

    pub fn mount_settings(&self) -> MountSettings {
        MountSettings {
            volume_name: self.volume_name.clone(),
            volume_icon: self.volume_icon.clone(),
            debug: self.debug,
            defer_auth: self.defer_auth,
            read_only: self.read_only,
            cache: self.cache.clone(),
            ..MountSettings::new(&self.mount_point)
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            service: self.service.clone(),
            failure_policy: self.failure_policy,
            detach_policy: self.detach_policy,
            unmount_timeout: Duration::from_secs(self.unmount_timeout_secs),
        }
    }

    pub fn device_config(&self) -> DirectoryDeviceConfig {
        DirectoryDeviceConfig::new(&self.device_path)
            .with_service(self.service.clone())
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

fn runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

fn default_mount_point() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Volumes/iPhone")
    } else {
        runtime_dir().join(APP_NAME)
    }
}

fn default_device_path() -> PathBuf {
    runtime_dir().join(format!("{}-device", APP_NAME))
}
