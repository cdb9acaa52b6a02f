//! Mount lifecycle controller
//!
//! Drives one device through `WaitingForDevice → Mounting → Running →
//! Unmounting → WaitingForDevice`, forever, until shut down.
//!
//! Device callbacks only enqueue [`ControlEvent`]s; every transition is made
//! on the controller thread. While `Running` the mount is moved into a
//! `fuse-loop` thread that blocks in the filesystem loop. The controller
//! keeps the loop's [`ExitRequester`] and uses it when the device detaches
//! or shutdown is requested, then takes the mount back to unmount it.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use common::{DeviceManager, ProtocolSession};

use super::backend::{ActiveMount, ExitRequester, MountBackend};
use super::builder::MountSessionBuilder;
use super::error::ControllerError;
use super::events::{ControlEvent, EventReceiver, EventSender, Received, ShutdownHandle};
use super::lifecycle::{LifecycleState, StatusHandle};

/// What to do when a session cannot be opened or a mount cannot be built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the controller with an error; the process exits with status 1
    #[default]
    Exit,
    /// Log, wait with exponential backoff and retry while the device stays attached
    Retry {
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
    },
}

/// What to do with a detach that arrives while the mount is being built
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachPolicy {
    /// Tear the fresh mount down without entering the filesystem loop
    #[default]
    Abort,
    /// Drop the detach and enter the loop anyway; protocol errors surface later
    Ignore,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Service identifier passed to `open_session`
    pub service: String,
    pub failure_policy: FailurePolicy,
    pub detach_policy: DetachPolicy,
    /// How long to wait for the loop to exit before forcing the unmount
    pub unmount_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            service: common::device::DEFAULT_SERVICE.to_string(),
            failure_policy: FailurePolicy::default(),
            detach_policy: DetachPolicy::default(),
            unmount_timeout: Duration::from_secs(10),
        }
    }
}

enum Wake {
    Attach,
    Shutdown,
}

enum CycleEnd {
    Completed,
    /// The device came back while the previous mount was being torn down
    Reattach,
    Shutdown,
}

/// Shortest retry delay, so a zero backoff cannot spin
const MIN_BACKOFF: Duration = Duration::from_millis(10);

/// `timeout` from now, or `None` when that instant is not representable
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial = Duration::from_millis(initial_ms).max(MIN_BACKOFF);
        Self {
            initial,
            max: Duration::from_millis(max_ms).max(initial),
            next: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Owns the mount lifecycle for a single device
pub struct MountController<M: ?Sized, B: MountBackend> {
    manager: Arc<M>,
    builder: MountSessionBuilder<B>,
    options: ControllerOptions,
    sender: EventSender,
    events: EventReceiver,
    status: StatusHandle,
    shutdown: ShutdownHandle,
    device_present: bool,
    cycle: u64,
    /// Loop thread given up on after a failed forced unmount, still owning its mount
    abandoned: Option<(u64, JoinHandle<B::Mount>)>,
}

impl<M, B> MountController<M, B>
where
    M: DeviceManager + ?Sized,
    B: MountBackend,
{
    pub fn new(
        manager: Arc<M>,
        builder: MountSessionBuilder<B>,
        options: ControllerOptions,
    ) -> Self {
        let (sender, events) = EventSender::channel();
        let shutdown = ShutdownHandle::new(sender.clone());
        Self {
            manager,
            builder,
            options,
            sender,
            events,
            status: StatusHandle::new(),
            shutdown,
            device_present: false,
            cycle: 0,
            abandoned: None,
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the controller on a dedicated `mount-controller` thread
    pub fn spawn(self) -> Result<JoinHandle<Result<(), ControllerError>>, ControllerError>
    where
        M: 'static,
    {
        thread::Builder::new()
            .name("mount-controller".to_string())
            .spawn(move || self.run())
            .map_err(|source| ControllerError::ThreadSpawn {
                name: "mount-controller",
                source,
            })
    }

    /// Run the lifecycle until shutdown.
    ///
    /// Returns `Ok(())` after a requested shutdown, or the error that ended
    /// the controller under [`FailurePolicy::Exit`].
    pub fn run(mut self) -> Result<(), ControllerError> {
        self.register_handlers();

        let mut backoff = match self.options.failure_policy {
            FailurePolicy::Retry {
                initial_backoff_ms,
                max_backoff_ms,
            } => Some(Backoff::new(initial_backoff_ms, max_backoff_ms)),
            FailurePolicy::Exit => None,
        };
        let mut retry_at = None;
        let mut reattach = false;

        loop {
            self.status.set(LifecycleState::WaitingForDevice);
            let pending = std::mem::take(&mut reattach);
            if let Wake::Shutdown = self.wait_for_device(retry_at.take(), pending) {
                break;
            }

            match self.mount_cycle() {
                Ok(end @ (CycleEnd::Completed | CycleEnd::Reattach)) => {
                    reattach = matches!(end, CycleEnd::Reattach);
                    if let Some(backoff) = backoff.as_mut() {
                        backoff.reset();
                    }
                }
                Ok(CycleEnd::Shutdown) => break,
                Err(err) => match backoff.as_mut() {
                    None => {
                        tracing::error!(error = %err, "Mount failed");
                        self.status.set(LifecycleState::WaitingForDevice);
                        return Err(err);
                    }
                    Some(backoff) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "Mount failed, will retry"
                        );
                        retry_at = deadline_after(delay);
                        if retry_at.is_none() {
                            tracing::warn!("Retry delay out of range, waiting for the next attach");
                        }
                    }
                },
            }
        }

        if let Some((cycle, _)) = self.abandoned.take() {
            tracing::warn!(cycle, "Leaving an unresponsive filesystem loop behind");
        }
        self.status.set(LifecycleState::WaitingForDevice);
        tracing::info!("Mount controller stopped");
        Ok(())
    }

    fn register_handlers(&self) {
        let attach = self.sender.clone();
        self.manager.set_attach_handler(Arc::new(move || {
            attach.send(ControlEvent::Attached);
        }));
        let detach = self.sender.clone();
        self.manager.set_detach_handler(Arc::new(move || {
            detach.send(ControlEvent::Detached);
        }));
    }

    /// Block in `WaitingForDevice` until an attach (or a due retry).
    ///
    /// `pending` carries an attach that was already seen while the previous
    /// mount was being torn down. No mount is started while an abandoned
    /// loop still holds the mount point; an attach seen meanwhile is kept
    /// until that loop's late exit has been reaped.
    fn wait_for_device(&mut self, mut retry_at: Option<Instant>, mut pending: bool) -> Wake {
        if pending {
            tracing::info!("Device reconnected, starting a new cycle");
        } else {
            tracing::info!("Waiting for device...");
        }

        loop {
            if self.shutdown.is_requested() {
                return Wake::Shutdown;
            }
            if pending && self.abandoned.is_none() {
                return Wake::Attach;
            }

            let event = match retry_at {
                Some(deadline) => match self.events.recv_deadline(deadline) {
                    Received::Event(event) => event,
                    Received::TimedOut => {
                        retry_at = None;
                        if self.device_present {
                            tracing::info!("Retrying mount");
                            pending = true;
                        }
                        continue;
                    }
                },
                None => self.events.recv(),
            };

            match event {
                ControlEvent::Attached => {
                    tracing::info!("Device connected");
                    self.device_present = true;
                    if self.abandoned.is_some() {
                        tracing::warn!("Previous mount is still held, deferring mount");
                    }
                    pending = true;
                }
                ControlEvent::Detached => {
                    tracing::debug!("Device detached while nothing is mounted");
                    self.device_present = false;
                    retry_at = None;
                    pending = false;
                }
                ControlEvent::Shutdown => return Wake::Shutdown,
                ControlEvent::LoopExited { cycle, .. } => self.reap(cycle),
            }
        }
    }

    /// Release the abandoned mount once its loop has finally returned
    fn reap(&mut self, cycle: u64) {
        match self.abandoned.take() {
            Some((abandoned, handle)) if abandoned == cycle => {
                tracing::info!(cycle, "Abandoned filesystem loop exited, releasing its mount");
                match handle.join() {
                    Ok(mount) => {
                        if let Err(e) = mount.unmount() {
                            tracing::warn!(error = %e, "Unmount failed");
                        }
                    }
                    Err(_) => tracing::error!("Filesystem loop thread panicked"),
                }
            }
            other => {
                self.abandoned = other;
                tracing::debug!(cycle, "Stale filesystem loop exit");
            }
        }
    }

    /// Open a session, mount it, run it and tear it down
    #[tracing::instrument(skip(self), fields(cycle = self.cycle + 1))]
    fn mount_cycle(&mut self) -> Result<CycleEnd, ControllerError> {
        self.cycle += 1;

        let session: Arc<dyn ProtocolSession> = self
            .manager
            .open_session(&self.options.service)
            .map_err(|source| ControllerError::SessionOpen {
                service: self.options.service.clone(),
                source,
            })?;

        self.status.set(LifecycleState::Mounting);
        tracing::info!("Initializing");
        let mut mount = match self.builder.mount(session) {
            Ok(mount) => mount,
            Err(err) => {
                self.status.set(LifecycleState::WaitingForDevice);
                return Err(err.into());
            }
        };
        tracing::info!(
            mount_point = %self.mount_point().display(),
            "Mounting filesystem"
        );

        // Anything queued now raced with the mount call. Only the last
        // presence change matters: detach then attach means the session is
        // stale but the device is back.
        let mut detached = false;
        let mut reattached = false;
        while let Some(event) = self.events.try_recv() {
            match event {
                ControlEvent::Attached if detached => {
                    self.device_present = true;
                    reattached = true;
                }
                ControlEvent::Attached => tracing::debug!("Ignoring attach while mounting"),
                ControlEvent::Detached => {
                    self.device_present = false;
                    detached = true;
                    reattached = false;
                }
                ControlEvent::Shutdown => {}
                ControlEvent::LoopExited { cycle, .. } => self.reap(cycle),
            }
        }

        if self.shutdown.is_requested() {
            self.teardown(mount);
            return Ok(CycleEnd::Shutdown);
        }

        if reattached {
            tracing::warn!("Device reconnected while mounting, remounting with a new session");
            self.teardown(mount);
            return Ok(CycleEnd::Reattach);
        }

        if detached {
            match self.options.detach_policy {
                DetachPolicy::Abort => {
                    tracing::warn!("Device detached while mounting, aborting mount");
                    self.teardown(mount);
                    return Ok(CycleEnd::Completed);
                }
                DetachPolicy::Ignore => {
                    tracing::warn!("Device detached while mounting, detach dropped");
                }
            }
        }

        let exit = mount.exit_handle();
        let cycle = self.cycle;
        let loop_events = self.sender.clone();
        let handle = thread::Builder::new()
            .name("fuse-loop".to_string())
            .spawn(move || {
                let error = mount.run().err().map(|e| e.to_string());
                loop_events.send(ControlEvent::LoopExited { cycle, error });
                mount
            })
            .map_err(|source| ControllerError::ThreadSpawn {
                name: "fuse-loop",
                source,
            })?;

        self.status.set(LifecycleState::Running);
        tracing::info!("Starting filesystem loop");

        Ok(self.supervise(exit, handle))
    }

    /// Wait in `Running` until the loop returns, then unmount
    fn supervise(
        &mut self,
        mut exit: <B::Mount as ActiveMount>::Exit,
        handle: JoinHandle<B::Mount>,
    ) -> CycleEnd {
        let timeout = self.options.unmount_timeout;
        let mut shutdown = false;
        let mut exiting = false;
        let mut reattach = false;
        let mut deadline: Option<Instant> = None;
        let mut forced = false;

        loop {
            let received = match deadline {
                Some(deadline) => self.events.recv_deadline(deadline),
                None => Received::Event(self.events.recv()),
            };

            match received {
                Received::Event(ControlEvent::Attached) if exiting => {
                    tracing::info!("Device reconnected, will remount after unmount");
                    self.device_present = true;
                    reattach = true;
                }
                Received::Event(ControlEvent::Attached) => {
                    tracing::warn!("Ignoring attach while a mount is active");
                }
                Received::Event(ControlEvent::Detached) => {
                    tracing::info!("Device disconnected");
                    self.device_present = false;
                    reattach = false;
                    if !exiting {
                        exiting = true;
                        request_exit(&mut exit);
                        deadline = deadline_after(timeout);
                    }
                }
                Received::Event(ControlEvent::Shutdown) => {
                    shutdown = true;
                    if !exiting {
                        exiting = true;
                        request_exit(&mut exit);
                        deadline = deadline_after(timeout);
                    }
                }
                Received::Event(ControlEvent::LoopExited { cycle, error }) => {
                    if cycle != self.cycle {
                        self.reap(cycle);
                        continue;
                    }
                    match error {
                        Some(error) => tracing::warn!(%error, "Filesystem loop failed"),
                        None => tracing::info!("Filesystem loop exited"),
                    }
                    break;
                }
                Received::TimedOut if !forced => {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Filesystem loop did not exit in time, forcing unmount"
                    );
                    if let Err(e) = self.builder.backend().force_unmount(self.mount_point()) {
                        tracing::error!(error = %e, "Forced unmount failed");
                    }
                    forced = true;
                    deadline = deadline_after(timeout);
                }
                Received::TimedOut => {
                    tracing::error!("Filesystem loop is unresponsive, abandoning it");
                    self.status.set(LifecycleState::Unmounting);
                    self.abandoned = Some((self.cycle, handle));
                    return cycle_end(shutdown, reattach);
                }
            }
        }

        match handle.join() {
            Ok(mount) => self.teardown(mount),
            Err(_) => {
                self.status.set(LifecycleState::Unmounting);
                tracing::error!("Filesystem loop thread panicked");
            }
        }

        cycle_end(shutdown || self.shutdown.is_requested(), reattach)
    }

    /// Enter `Unmounting` and release the mount and its session
    fn teardown(&self, mount: B::Mount) {
        self.status.set(LifecycleState::Unmounting);
        tracing::info!("Unmounting filesystem");
        if let Err(e) = mount.unmount() {
            tracing::warn!(error = %e, "Unmount failed");
        }
    }

    fn mount_point(&self) -> &Path {
        &self.builder.settings().mount_point
    }
}

fn cycle_end(shutdown: bool, reattach: bool) -> CycleEnd {
    if shutdown {
        CycleEnd::Shutdown
    } else if reattach {
        CycleEnd::Reattach
    } else {
        CycleEnd::Completed
    }
}

fn request_exit<E: ExitRequester>(exit: &mut E) {
    if let Err(e) = exit.request_exit() {
        tracing::warn!(error = %e, "Failed to request filesystem loop exit");
    }
}
