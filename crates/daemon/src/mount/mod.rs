//! Mount lifecycle management
//!
//! # Architecture
//!
//! - `MountController`: the attach → mount → run → unmount state machine
//! - `MountSessionBuilder`: per-cycle configuration, mount point and mount call
//! - `MountBackend` / `ActiveMount`: the kernel filesystem seam
//! - `StatusHandle`: observable `LifecycleState`
//! - `ControlEvent`: the single channel into the controller thread

mod backend;
mod builder;
mod configuration;
mod controller;
mod error;
mod events;
mod lifecycle;

pub use backend::{lazy_unmount, ActiveMount, ExitRequester, MountBackend};
pub use builder::{prepare_mount_point, MountSessionBuilder};
pub use configuration::{CacheSettings, MountConfiguration, MountSettings};
pub use controller::{ControllerOptions, DetachPolicy, FailurePolicy, MountController};
pub use error::{ControllerError, MountError};
pub use events::{ControlEvent, EventReceiver, EventSender, Received, ShutdownHandle};
pub use lifecycle::{LifecycleState, StatusHandle, UnknownState};
