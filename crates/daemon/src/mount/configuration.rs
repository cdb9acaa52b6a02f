//! Per-cycle mount configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata cache tuning for the mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// TTL for attributes and directory listings, in seconds
    pub ttl_secs: u32,
    /// TTL for paths known not to exist, in seconds
    pub negative_ttl_secs: u32,
    /// Maximum number of cached attribute entries
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            negative_ttl_secs: 2,
            max_entries: 10_000,
        }
    }
}

/// Long-lived mount settings from which each cycle's configuration is built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSettings {
    pub mount_point: PathBuf,
    /// Volume name shown by the desktop
    pub volume_name: String,
    /// Icon shown for the volume (macOS)
    pub volume_icon: Option<PathBuf>,
    /// Filesystem name reported in the mount table
    pub fs_name: String,
    /// Ask the FUSE layer for debug output
    pub debug: bool,
    /// Defer permission checks to the filesystem (macOS `defer_auth`)
    pub defer_auth: bool,
    pub read_only: bool,
    pub cache: CacheSettings,
}

impl MountSettings {
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            volume_name: "iPhone".to_string(),
            volume_icon: Some(PathBuf::from("./iPhoneDisk.icns")),
            fs_name: "iphonedisk".to_string(),
            debug: cfg!(debug_assertions),
            defer_auth: true,
            read_only: false,
            cache: CacheSettings::default(),
        }
    }
}

/// Immutable description of one mount attempt.
///
/// Built fresh for every cycle and discarded once the mount call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfiguration {
    /// Identifies this mount cycle in logs
    pub cycle_id: Uuid,
    pub mount_point: PathBuf,
    pub volume_name: String,
    pub volume_icon: Option<PathBuf>,
    pub fs_name: String,
    pub debug: bool,
    pub defer_auth: bool,
    pub read_only: bool,
    pub cache: CacheSettings,
}

impl MountConfiguration {
    pub fn from_settings(settings: &MountSettings) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            mount_point: settings.mount_point.clone(),
            volume_name: settings.volume_name.clone(),
            volume_icon: settings.volume_icon.clone(),
            fs_name: settings.fs_name.clone(),
            debug: settings.debug,
            defer_auth: settings.defer_auth,
            read_only: settings.read_only,
            cache: settings.cache.clone(),
        }
    }

    /// Mount options in `-o` form understood by macFUSE.
    ///
    /// Generic options (fs name, read-only) are not included here.
    pub fn custom_options(&self) -> Vec<String> {
        let mut options = Vec::new();
        if self.debug {
            options.push("debug".to_string());
        }
        if self.defer_auth {
            options.push("defer_auth".to_string());
        }
        options.push(format!("volname={}", self.volume_name));
        if let Some(icon) = &self.volume_icon {
            options.push(format!("volicon={}", icon.display()));
        }
        options
    }
}
