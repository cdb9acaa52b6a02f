//! Device connection boundary
//!
//! A [`DeviceManager`] notifies on attach/detach and opens protocol sessions
//! on demand. A [`ProtocolSession`] is the open connection through which
//! individual file operations run against the device's private storage.
//!
//! The daemon only depends on these traits. [`directory`] provides a
//! concrete pair backed by a local directory that appears and disappears
//! with the device.

pub mod directory;
mod session;

use std::sync::Arc;

use crate::callback::Callback;

pub use directory::{DirectoryDeviceConfig, DirectoryDeviceManager, DirectorySession};
pub use session::{DirEntry, EntryInfo, EntryKind, ProtocolSession, SessionError, VolumeInfo};

/// Default service identifier for the device's file access endpoint
pub const DEFAULT_SERVICE: &str = "com.apple.afc";

/// Source of attach/detach notifications and protocol sessions.
///
/// Handlers are invoked synchronously on whatever thread detects the
/// change. Registering a handler replaces the previous one for that event.
pub trait DeviceManager: Send + Sync {
    /// Register the handler fired when the device becomes available
    fn set_attach_handler(&self, handler: Callback);

    /// Register the handler fired when the device goes away
    fn set_detach_handler(&self, handler: Callback);

    /// Open a session to `service` on the attached device
    fn open_session(&self, service: &str) -> Result<Arc<dyn ProtocolSession>, SessionError>;
}

/// Errors creating a device manager
#[derive(Debug, thiserror::Error)]
pub enum DeviceManagerError {
    #[error("device path is not absolute: {0}")]
    RelativePath(String),
    #[error("failed to start device poll thread: {0}")]
    Spawn(#[from] std::io::Error),
}
