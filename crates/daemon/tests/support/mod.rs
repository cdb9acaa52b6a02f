//! Fake device manager and mount backend for lifecycle tests

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use common::device::{DirEntry, EntryInfo, VolumeInfo};
use common::{Callback, DeviceManager, HandlerSlot, ProtocolSession, SessionError};
use iphonedisk_daemon::mount::{
    ActiveMount, ControllerError, ControllerOptions, ExitRequester, MountBackend,
    MountConfiguration, MountController, MountError, MountSessionBuilder, MountSettings,
    ShutdownHandle, StatusHandle,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `check` until it holds or [`TIMEOUT`] passes
pub fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Session that refuses every operation
pub struct NullSession;

impl ProtocolSession for NullSession {
    fn stat(&self, _path: &str) -> Result<EntryInfo, SessionError> {
        Err(SessionError::Disconnected)
    }
    fn read_dir(&self, _path: &str) -> Result<Vec<DirEntry>, SessionError> {
        Err(SessionError::Disconnected)
    }
    fn read(&self, _path: &str, _offset: u64, _size: u32) -> Result<Vec<u8>, SessionError> {
        Err(SessionError::Disconnected)
    }
    fn write(&self, _path: &str, _offset: u64, _data: &[u8]) -> Result<u32, SessionError> {
        Err(SessionError::Disconnected)
    }
    fn create(&self, _path: &str) -> Result<(), SessionError> {
        Err(SessionError::Disconnected)
    }
    fn mkdir(&self, _path: &str) -> Result<(), SessionError> {
        Err(SessionError::Disconnected)
    }
    fn remove_file(&self, _path: &str) -> Result<(), SessionError> {
        Err(SessionError::Disconnected)
    }
    fn remove_dir(&self, _path: &str) -> Result<(), SessionError> {
        Err(SessionError::Disconnected)
    }
    fn rename(&self, _from: &str, _to: &str) -> Result<(), SessionError> {
        Err(SessionError::Disconnected)
    }
    fn truncate(&self, _path: &str, _size: u64) -> Result<(), SessionError> {
        Err(SessionError::Disconnected)
    }
    fn volume_info(&self) -> Result<VolumeInfo, SessionError> {
        Err(SessionError::Disconnected)
    }
    fn is_connected(&self) -> bool {
        false
    }
}

/// Device manager whose attach/detach are fired by the test
#[derive(Default)]
pub struct FakeDevice {
    attach: HandlerSlot<dyn Fn() + Send + Sync>,
    detach: HandlerSlot<dyn Fn() + Send + Sync>,
    fail_open: AtomicBool,
    opens: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fire_attach(&self) -> bool {
        self.attach.fire()
    }

    pub fn fire_detach(&self) -> bool {
        self.detach.fire()
    }

    pub fn handlers_registered(&self) -> bool {
        self.attach.is_set() && self.detach.is_set()
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceManager for FakeDevice {
    fn set_attach_handler(&self, handler: Callback) {
        self.attach.set(handler);
    }

    fn set_detach_handler(&self, handler: Callback) {
        self.detach.set(handler);
    }

    fn open_session(&self, _service: &str) -> Result<Arc<dyn ProtocolSession>, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SessionError::Disconnected);
        }
        Ok(Arc::new(NullSession))
    }
}

type MountHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct BackendState {
    mount_calls: AtomicUsize,
    mounts: AtomicUsize,
    runs: AtomicUsize,
    unmounts: AtomicUsize,
    force_unmounts: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    fail_mounts: AtomicUsize,
    ignore_exit: AtomicBool,
    ignore_force: AtomicBool,
    current_exit: Mutex<Option<flume::Sender<()>>>,
    on_mount: Mutex<Option<MountHook>>,
}

/// Backend whose mounts block in `run` until told to exit
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount calls, including failed ones
    pub fn mount_calls(&self) -> usize {
        self.state.mount_calls.load(Ordering::SeqCst)
    }

    /// Successful mounts
    pub fn mounts(&self) -> usize {
        self.state.mounts.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.state.runs.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> usize {
        self.state.unmounts.load(Ordering::SeqCst)
    }

    pub fn force_unmounts(&self) -> usize {
        self.state.force_unmounts.load(Ordering::SeqCst)
    }

    /// Mounts currently held
    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.state.max_live.load(Ordering::SeqCst)
    }

    /// Fail the next `count` mount calls
    pub fn fail_next(&self, count: usize) {
        self.state.fail_mounts.store(count, Ordering::SeqCst);
    }

    /// Make exit requests do nothing; only a forced unmount ends the loop
    pub fn ignore_exit(&self, ignore: bool) {
        self.state.ignore_exit.store(ignore, Ordering::SeqCst);
    }

    /// Make forced unmounts do nothing as well
    pub fn ignore_force(&self, ignore: bool) {
        self.state.ignore_force.store(ignore, Ordering::SeqCst);
    }

    /// Run `hook` inside every mount call
    pub fn on_mount(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.state.on_mount.lock() = Some(Box::new(hook));
    }

    /// End the running loop as if the filesystem were unmounted externally
    pub fn end_loop(&self) -> bool {
        match self.state.current_exit.lock().as_ref() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

pub struct FakeMount {
    state: Arc<BackendState>,
    exit_tx: flume::Sender<()>,
    exit_rx: flume::Receiver<()>,
    released: bool,
}

pub struct FakeExit {
    state: Arc<BackendState>,
    tx: flume::Sender<()>,
}

impl ExitRequester for FakeExit {
    fn request_exit(&mut self) -> Result<(), MountError> {
        if !self.state.ignore_exit.load(Ordering::SeqCst) {
            let _ = self.tx.send(());
        }
        Ok(())
    }
}

impl ActiveMount for FakeMount {
    type Exit = FakeExit;

    fn exit_handle(&mut self) -> FakeExit {
        FakeExit {
            state: self.state.clone(),
            tx: self.exit_tx.clone(),
        }
    }

    fn run(&mut self) -> io::Result<()> {
        self.state.runs.fetch_add(1, Ordering::SeqCst);
        let _ = self.exit_rx.recv();
        Ok(())
    }

    fn unmount(mut self) -> Result<(), MountError> {
        self.state.unmounts.fetch_add(1, Ordering::SeqCst);
        self.release();
        Ok(())
    }
}

impl FakeMount {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.state.live.fetch_sub(1, Ordering::SeqCst);
            self.state.current_exit.lock().take();
        }
    }
}

impl Drop for FakeMount {
    fn drop(&mut self) {
        self.release();
    }
}

impl MountBackend for FakeBackend {
    type Mount = FakeMount;

    fn mount(
        &self,
        _config: &MountConfiguration,
        _session: Arc<dyn ProtocolSession>,
    ) -> Result<FakeMount, MountError> {
        self.state.mount_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.state.on_mount.lock().as_ref() {
            hook();
        }

        let fail = self
            .state
            .fail_mounts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(MountError::Backend("injected mount failure".to_string()));
        }

        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_live.fetch_max(live, Ordering::SeqCst);
        self.state.mounts.fetch_add(1, Ordering::SeqCst);

        let (exit_tx, exit_rx) = flume::unbounded();
        *self.state.current_exit.lock() = Some(exit_tx.clone());

        Ok(FakeMount {
            state: self.state.clone(),
            exit_tx,
            exit_rx,
            released: false,
        })
    }

    fn force_unmount(&self, _mount_point: &Path) -> Result<(), MountError> {
        self.state.force_unmounts.fetch_add(1, Ordering::SeqCst);
        if self.state.ignore_force.load(Ordering::SeqCst) {
            return Err(MountError::Backend("injected unmount failure".to_string()));
        }
        if let Some(tx) = self.state.current_exit.lock().as_ref() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

/// A controller running on its own thread against fakes
pub struct Harness {
    pub device: Arc<FakeDevice>,
    pub backend: FakeBackend,
    pub status: StatusHandle,
    pub shutdown: ShutdownHandle,
    mount_point: std::path::PathBuf,
    handle: Option<JoinHandle<Result<(), ControllerError>>>,
    _dir: TempDir,
}

impl Harness {
    pub fn start(options: ControllerOptions) -> Self {
        Self::start_with(options, FakeBackend::new())
    }

    pub fn start_with(options: ControllerOptions, backend: FakeBackend) -> Self {
        init_tracing();

        let dir = TempDir::new().expect("tempdir");
        let mount_point = dir.path().join("iPhone");
        let device = FakeDevice::new();
        let builder = MountSessionBuilder::new(MountSettings::new(&mount_point), backend.clone());
        let controller = MountController::new(device.clone(), builder, options);

        let status = controller.status();
        let shutdown = controller.shutdown_handle();
        let handle = controller.spawn().expect("spawn controller");

        assert!(
            eventually(|| device.handlers_registered()),
            "controller never registered its handlers"
        );

        Self {
            device,
            backend,
            status,
            shutdown,
            mount_point,
            handle: Some(handle),
            _dir: dir,
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Wait for the controller thread to return
    pub fn join(&mut self) -> Result<(), ControllerError> {
        let handle = self.handle.take().expect("controller already joined");
        assert!(
            eventually(|| handle.is_finished()),
            "controller did not stop in time"
        );
        handle.join().expect("controller panicked")
    }

    /// Request shutdown and wait for the controller to return
    pub fn stop(&mut self) -> Result<(), ControllerError> {
        self.shutdown.shutdown();
        self.join()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown.shutdown();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
