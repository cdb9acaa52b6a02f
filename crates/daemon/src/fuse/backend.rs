//! fuser-backed mount backend

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use fuser::{MountOption, Session, SessionUnmounter};

use common::ProtocolSession;

use super::device_fs::DeviceFs;
use crate::mount::{ActiveMount, ExitRequester, MountBackend, MountConfiguration, MountError};

/// Mounts device sessions through the kernel FUSE interface
#[derive(Debug, Clone, Copy, Default)]
pub struct FuserBackend;

impl MountBackend for FuserBackend {
    type Mount = FuserMount;

    fn mount(
        &self,
        config: &MountConfiguration,
        session: Arc<dyn ProtocolSession>,
    ) -> Result<FuserMount, MountError> {
        let fs = DeviceFs::new(session, config)?;
        let options = fuse_options(config);

        tracing::info!(
            mount_point = %config.mount_point.display(),
            read_only = config.read_only,
            "Mounting filesystem"
        );

        let session = Session::new(fs, &config.mount_point, &options).map_err(|source| {
            MountError::Mount {
                mount_point: config.mount_point.clone(),
                source,
            }
        })?;

        Ok(FuserMount {
            session,
            mount_point: config.mount_point.clone(),
        })
    }
}

/// A mounted [`DeviceFs`] waiting for, or running, its request loop
pub struct FuserMount {
    session: Session<DeviceFs>,
    mount_point: PathBuf,
}

impl FuserMount {
    pub fn mount_point(&self) -> &PathBuf {
        &self.mount_point
    }
}

/// Unmounts the session, which makes its request loop return
pub struct FuserExit {
    unmounter: SessionUnmounter,
}

impl ExitRequester for FuserExit {
    fn request_exit(&mut self) -> Result<(), MountError> {
        self.unmounter.unmount().map_err(MountError::Unmount)
    }
}

impl ActiveMount for FuserMount {
    type Exit = FuserExit;

    fn exit_handle(&mut self) -> FuserExit {
        FuserExit {
            unmounter: self.session.unmount_callable(),
        }
    }

    fn run(&mut self) -> io::Result<()> {
        self.session.run()
    }

    fn unmount(mut self) -> Result<(), MountError> {
        tracing::debug!(mount_point = %self.mount_point.display(), "Unmounting filesystem");
        self.session.unmount();
        Ok(())
    }
}

/// fuser mount options for `config`.
///
/// macFUSE-specific options (volume name, icon, `defer_auth`) are only
/// passed on macOS.
pub fn fuse_options(config: &MountConfiguration) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype("iphonedisk".to_string()),
        MountOption::NoAtime,
    ];

    if config.read_only {
        options.push(MountOption::RO);
    } else {
        options.push(MountOption::RW);
    }

    if cfg!(target_os = "macos") {
        options.extend(config.custom_options().into_iter().map(MountOption::CUSTOM));
    }

    options
}
