//! Device-side building blocks shared by the iphonedisk daemon.
//!
//! - [`callback`]: single-slot handler registration used by device managers
//! - [`device`]: the device connection manager and protocol session seams,
//!   plus a directory-backed implementation of both

pub mod callback;
pub mod device;

pub use callback::{Callback, Callback1, HandlerSlot};
pub use device::{DeviceManager, ProtocolSession, SessionError};
