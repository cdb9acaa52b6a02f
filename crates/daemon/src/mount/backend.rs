//! Seam between the controller and the kernel filesystem interface
//!
//! The controller only needs three things from a mounted filesystem: run
//! its blocking event loop, ask that loop to exit from another thread, and
//! unmount it afterwards. Keeping those behind traits lets the lifecycle be
//! driven without FUSE privileges.

use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use common::ProtocolSession;

use super::configuration::MountConfiguration;
use super::error::MountError;

/// Asks a running filesystem loop to return
pub trait ExitRequester: Send {
    fn request_exit(&mut self) -> Result<(), MountError>;
}

/// A live mount
pub trait ActiveMount: Send + 'static {
    type Exit: ExitRequester;

    /// Handle that makes [`run`](ActiveMount::run) return when used
    fn exit_handle(&mut self) -> Self::Exit;

    /// Serve filesystem requests until the mount is told to exit or fails
    fn run(&mut self) -> io::Result<()>;

    /// Remove the mount from the mount point
    fn unmount(self) -> Result<(), MountError>;
}

/// Creates mounts for protocol sessions
pub trait MountBackend: Send + Sync + 'static {
    type Mount: ActiveMount;

    /// Build the operation table for `session` and mount it per `config`
    fn mount(
        &self,
        config: &MountConfiguration,
        session: Arc<dyn ProtocolSession>,
    ) -> Result<Self::Mount, MountError>;

    /// Detach a mount whose loop does not respond to an exit request
    fn force_unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        lazy_unmount(mount_point)
    }
}

/// Detach `mount_point` with the platform unmount tool, even if busy
pub fn lazy_unmount(mount_point: &Path) -> Result<(), MountError> {
    let path = mount_point.to_string_lossy();

    #[cfg(target_os = "macos")]
    let output = Command::new("umount").args(["-f", path.as_ref()]).output();

    #[cfg(not(target_os = "macos"))]
    let output = Command::new("fusermount")
        .args(["-u", "-z", path.as_ref()])
        .output();

    let output = output.map_err(|e| MountError::ForceUnmount(e.to_string()))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(MountError::ForceUnmount(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}
