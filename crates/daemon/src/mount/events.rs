//! Control events delivered to the mount controller
//!
//! Device callbacks, the filesystem loop thread and the shutdown handle all
//! talk to the controller through one flume channel. The controller thread
//! is the only consumer, so every state transition happens there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Messages the controller reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The device became available
    Attached,
    /// The device went away
    Detached,
    /// Stop the controller after tearing down any active mount
    Shutdown,
    /// The filesystem loop for mount cycle `cycle` returned
    LoopExited { cycle: u64, error: Option<String> },
}

/// Cloneable sending half of the control channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: flume::Sender<ControlEvent>,
}

impl EventSender {
    /// Create a sender and receiver pair
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, EventReceiver { rx })
    }

    /// Send an event. Never blocks; returns `false` once the controller is gone.
    pub fn send(&self, event: ControlEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Outcome of a bounded receive
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Event(ControlEvent),
    TimedOut,
}

/// Receiving half, owned by the controller thread
#[derive(Debug)]
pub struct EventReceiver {
    rx: flume::Receiver<ControlEvent>,
}

impl EventReceiver {
    /// Block for the next event.
    ///
    /// A disconnected channel reads as [`ControlEvent::Shutdown`].
    pub fn recv(&self) -> ControlEvent {
        self.rx.recv().unwrap_or(ControlEvent::Shutdown)
    }

    /// Block for the next event until `deadline`
    pub fn recv_deadline(&self, deadline: Instant) -> Received {
        match self.rx.recv_deadline(deadline) {
            Ok(event) => Received::Event(event),
            Err(flume::RecvTimeoutError::Timeout) => Received::TimedOut,
            Err(flume::RecvTimeoutError::Disconnected) => Received::Event(ControlEvent::Shutdown),
        }
    }

    /// Take an already-queued event without blocking
    pub fn try_recv(&self) -> Option<ControlEvent> {
        self.rx.try_recv().ok()
    }
}

/// Requests a graceful stop of the mount controller.
///
/// Cheap to clone; safe to call from signal handlers' async tasks or any
/// other thread, any number of times.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    events: EventSender,
}

impl ShutdownHandle {
    pub(crate) fn new(events: EventSender) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutdown requested");
            self.events.send(ControlEvent::Shutdown);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
