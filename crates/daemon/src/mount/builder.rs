//! Mount session builder
//!
//! Turns an open protocol session into a live mount: a fresh
//! [`MountConfiguration`], a re-created mount point, and the backend's
//! mount call. Nothing is retained between cycles.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::ProtocolSession;

use super::backend::MountBackend;
use super::configuration::{MountConfiguration, MountSettings};
use super::error::MountError;

pub struct MountSessionBuilder<B> {
    settings: MountSettings,
    backend: B,
}

impl<B: MountBackend> MountSessionBuilder<B> {
    pub fn new(settings: MountSettings, backend: B) -> Self {
        Self { settings, backend }
    }

    pub fn settings(&self) -> &MountSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Configuration for a new mount cycle
    pub fn configuration(&self) -> MountConfiguration {
        MountConfiguration::from_settings(&self.settings)
    }

    /// Mount `session` at the configured mount point
    pub fn mount(&self, session: Arc<dyn ProtocolSession>) -> Result<B::Mount, MountError> {
        let config = self.configuration();
        tracing::debug!(
            cycle = %config.cycle_id,
            mount_point = %config.mount_point.display(),
            options = ?config.custom_options(),
            "Building mount"
        );

        prepare_mount_point(&config.mount_point);
        self.backend.mount(&config, session)
    }
}

/// Re-create the mount point directory.
///
/// Best effort: a stale empty directory is removed and a fresh one created
/// with mode 0755. Failures are logged and otherwise ignored; the mount
/// call reports anything that actually matters.
pub fn prepare_mount_point(path: &Path) {
    if let Err(e) = fs::remove_dir(path) {
        tracing::debug!(path = %path.display(), error = %e, "Could not remove mount point");
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    if let Err(e) = builder.create(path) {
        tracing::debug!(path = %path.display(), error = %e, "Could not create mount point");
    }
}
