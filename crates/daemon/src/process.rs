//! Service wiring: device manager, mount backend and controller

use std::sync::Arc;
use std::thread::JoinHandle;

use common::device::{DeviceManagerError, DirectoryDeviceManager};

use crate::config::{Config, ConfigError};
use crate::mount::{
    ControllerError, MountBackend, MountController, MountSessionBuilder, StatusHandle,
};

pub use crate::mount::ShutdownHandle;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to initialize device manager: {0}")]
    DeviceManager(#[from] DeviceManagerError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("mount controller thread panicked")]
    Panicked,
    #[error("built without FUSE support")]
    Unsupported,
}

/// A running mount service
pub struct ServiceHandle {
    manager: Arc<DirectoryDeviceManager>,
    controller: JoinHandle<Result<(), ControllerError>>,
    shutdown: ShutdownHandle,
    status: StatusHandle,
}

impl ServiceHandle {
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Block until the controller stops, then stop watching the device
    pub fn wait(self) -> Result<(), ServiceError> {
        let result = self.controller.join();
        self.manager.stop();
        match result {
            Ok(outcome) => outcome.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Panicked),
        }
    }
}

/// Start the service with an explicit mount backend
pub fn spawn_with_backend<B: MountBackend>(
    config: &Config,
    backend: B,
) -> Result<ServiceHandle, ServiceError> {
    config.validate()?;

    let manager = Arc::new(DirectoryDeviceManager::start(config.device_config())?);
    let builder = MountSessionBuilder::new(config.mount_settings(), backend);
    let controller = MountController::new(manager.clone(), builder, config.controller_options());

    let shutdown = controller.shutdown_handle();
    let status = controller.status();
    let controller = controller.spawn()?;

    tracing::info!(
        mount_point = %config.mount_point.display(),
        service = %config.service,
        "Mount service started"
    );

    Ok(ServiceHandle {
        manager,
        controller,
        shutdown,
        status,
    })
}

/// Start the service with the FUSE backend
#[cfg(feature = "fuse")]
pub fn spawn_service(config: &Config) -> Result<ServiceHandle, ServiceError> {
    spawn_with_backend(config, crate::fuse::FuserBackend)
}

#[cfg(not(feature = "fuse"))]
pub fn spawn_service(_config: &Config) -> Result<ServiceHandle, ServiceError> {
    Err(ServiceError::Unsupported)
}

/// Start the service and block until it stops
pub fn start_service(config: &Config) -> Result<(), ServiceError> {
    spawn_service(config)?.wait()
}
