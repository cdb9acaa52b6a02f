pub mod config;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod logging;
pub mod mount;
pub mod process;
pub mod version;

pub use config::{Config, ConfigError};
pub use mount::{LifecycleState, MountController, StatusHandle};
pub use process::{spawn_service, spawn_with_backend, start_service, ServiceError, ShutdownHandle};
pub use version::{build_info, BuildInfo};
