use std::io;
use std::path::PathBuf;

use common::SessionError;

/// Errors from building, mounting or unmounting a filesystem
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("failed to build filesystem handlers: {0}")]
    HandlerTable(#[source] SessionError),
    #[error("mount failed at {mount_point}: {source}")]
    Mount {
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unmount failed: {0}")]
    Unmount(#[source] io::Error),
    #[error("forced unmount failed: {0}")]
    ForceUnmount(String),
    #[error("mount backend error: {0}")]
    Backend(String),
}

/// Fatal outcomes of [`MountController::run`](super::MountController::run)
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("opening {service} failed: {source}")]
    SessionOpen {
        service: String,
        #[source]
        source: SessionError,
    },
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}
