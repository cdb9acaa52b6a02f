//! Directory-backed device
//!
//! The device is considered attached while `device_path` exists as a
//! directory. A poll thread watches the path and fires the registered
//! attach/detach handlers on transitions. Sessions serve file operations
//! directly from that directory and start failing with
//! [`SessionError::Disconnected`] as soon as it disappears. A session never
//! recovers: once the directory is gone, or replaced by another one, every
//! later call on that session fails even if the path comes back.
//!
//! Symlinks inside the directory are reported by `stat` and can be removed
//! or renamed, but are never followed.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::session::{DirEntry, EntryInfo, EntryKind, ProtocolSession, SessionError, VolumeInfo};
use super::{DeviceManager, DeviceManagerError, DEFAULT_SERVICE};
use crate::callback::{Callback, HandlerSlot};

/// Configuration for a [`DirectoryDeviceManager`]
#[derive(Debug, Clone)]
pub struct DirectoryDeviceConfig {
    /// Directory that exists only while the device is attached
    pub device_path: PathBuf,
    /// The single service identifier this device answers to
    pub service: String,
    /// How often the device path is checked
    pub poll_interval: Duration,
}

impl DirectoryDeviceConfig {
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            service: DEFAULT_SERVICE.to_string(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

struct Shared {
    config: DirectoryDeviceConfig,
    attach: HandlerSlot<dyn Fn() + Send + Sync>,
    detach: HandlerSlot<dyn Fn() + Send + Sync>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Device manager that polls a directory for attach/detach
pub struct DirectoryDeviceManager {
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryDeviceManager {
    /// Start watching `config.device_path` on a dedicated poll thread
    pub fn start(config: DirectoryDeviceConfig) -> Result<Self, DeviceManagerError> {
        if !config.device_path.is_absolute() {
            return Err(DeviceManagerError::RelativePath(
                config.device_path.display().to_string(),
            ));
        }

        tracing::info!(
            device_path = %config.device_path.display(),
            service = %config.service,
            poll_ms = config.poll_interval.as_millis() as u64,
            "Watching for device"
        );

        let shared = Arc::new(Shared {
            config,
            attach: HandlerSlot::new(),
            detach: HandlerSlot::new(),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let poll_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("device-poll".to_string())
            .spawn(move || poll_loop(&poll_shared))?;

        Ok(Self {
            shared,
            poller: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &DirectoryDeviceConfig {
        &self.shared.config
    }

    /// Whether the device path currently exists
    pub fn is_present(&self) -> bool {
        self.shared.config.device_path.is_dir()
    }

    /// Stop the poll thread. Handlers will not fire afterwards.
    pub fn stop(&self) {
        {
            let mut stopped = self.shared.stopped.lock();
            *stopped = true;
            self.shared.wake.notify_all();
        }

        if let Some(handle) = self.poller.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DirectoryDeviceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DeviceManager for DirectoryDeviceManager {
    fn set_attach_handler(&self, handler: Callback) {
        self.shared.attach.set(handler);
    }

    fn set_detach_handler(&self, handler: Callback) {
        self.shared.detach.set(handler);
    }

    fn open_session(&self, service: &str) -> Result<Arc<dyn ProtocolSession>, SessionError> {
        if service != self.shared.config.service {
            return Err(SessionError::UnknownService(service.to_string()));
        }
        let session = DirectorySession::open(&self.shared.config.device_path)?;
        Ok(Arc::new(session))
    }
}

fn poll_loop(shared: &Shared) {
    // Presence last seen by a handler. Only advances once a handler has
    // actually been fired, so a device that is already attached when the
    // manager starts is reported as soon as someone registers.
    let mut reported = false;

    loop {
        let present = shared.config.device_path.is_dir();
        if present != reported {
            let fired = if present {
                shared.attach.fire()
            } else {
                shared.detach.fire()
            };
            if fired {
                tracing::debug!(present, "Device presence changed");
                reported = present;
            }
        }

        let mut stopped = shared.stopped.lock();
        if *stopped {
            break;
        }
        shared.wake.wait_for(&mut stopped, shared.config.poll_interval);
        if *stopped {
            break;
        }
    }

    tracing::debug!("Device poll thread stopped");
}

/// Protocol session serving files from a directory
#[derive(Debug, Clone)]
pub struct DirectorySession {
    root: PathBuf,
    identity: (u64, u64),
    disconnected: Arc<AtomicBool>,
}

impl DirectorySession {
    /// Open a session rooted at `root`, which must currently exist
    pub fn open(root: &Path) -> Result<Self, SessionError> {
        let identity = root_identity(root).ok_or(SessionError::Disconnected)?;
        Ok(Self {
            root: root.to_path_buf(),
            identity,
            disconnected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the directory this session was opened on is still there.
    /// Latches to `false` the first time it is not.
    fn check_connected(&self) -> bool {
        if self.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        if root_identity(&self.root) == Some(self.identity) {
            return true;
        }
        tracing::debug!(root = %self.root.display(), "Device directory gone, session closed");
        self.disconnected.store(true, Ordering::SeqCst);
        false
    }

    /// Map a device path onto the host.
    ///
    /// `..` and symlinks in intermediate components are refused; the last
    /// component may itself be a symlink.
    fn resolve(&self, path: &str) -> Result<PathBuf, SessionError> {
        if !self.check_connected() {
            return Err(SessionError::Disconnected);
        }

        let mut parts = Vec::new();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => parts.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(SessionError::InvalidPath(path.to_string()))
                }
            }
        }

        let mut resolved = self.root.clone();
        let last = parts.len().saturating_sub(1);
        for (i, part) in parts.into_iter().enumerate() {
            resolved.push(part);
            if i < last && is_symlink(&resolved) {
                return Err(SessionError::InvalidPath(path.to_string()));
            }
        }
        Ok(resolved)
    }

    /// Like [`resolve`](Self::resolve), for operations that would follow a
    /// symlink in the last component
    fn resolve_target(&self, path: &str) -> Result<PathBuf, SessionError> {
        let host = self.resolve(path)?;
        if is_symlink(&host) {
            return Err(SessionError::InvalidPath(path.to_string()));
        }
        Ok(host)
    }

    fn io<T>(path: &str, result: std::io::Result<T>) -> Result<T, SessionError> {
        result.map_err(|e| SessionError::from_io(path, e))
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Device and inode of `path`, if it is a directory
#[cfg(unix)]
fn root_identity(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::metadata(path).ok()?;
    meta.is_dir().then(|| (meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn root_identity(path: &Path) -> Option<(u64, u64)> {
    path.is_dir().then_some((0, 0))
}

fn entry_kind(file_type: fs::FileType) -> EntryKind {
    if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

impl ProtocolSession for DirectorySession {
    fn stat(&self, path: &str) -> Result<EntryInfo, SessionError> {
        let host = self.resolve(path)?;
        let meta = Self::io(path, fs::symlink_metadata(&host))?;
        Ok(EntryInfo {
            kind: entry_kind(meta.file_type()),
            size: meta.len(),
            modified: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
        })
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SessionError> {
        let host = self.resolve_target(path)?;
        let mut entries = Vec::new();
        for entry in Self::io(path, fs::read_dir(&host))? {
            let entry = Self::io(path, entry)?;
            let file_type = Self::io(path, entry.file_type())?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: entry_kind(file_type),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, SessionError> {
        let host = self.resolve_target(path)?;
        let mut file = Self::io(path, File::open(&host))?;
        Self::io(path, file.seek(SeekFrom::Start(offset)))?;
        let mut buf = Vec::with_capacity(size as usize);
        Self::io(path, file.take(size as u64).read_to_end(&mut buf))?;
        Ok(buf)
    }

    fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, SessionError> {
        let host = self.resolve_target(path)?;
        let mut file = Self::io(path, OpenOptions::new().write(true).open(&host))?;
        Self::io(path, file.seek(SeekFrom::Start(offset)))?;
        Self::io(path, file.write_all(data))?;
        Ok(data.len() as u32)
    }

    fn create(&self, path: &str) -> Result<(), SessionError> {
        let host = self.resolve(path)?;
        Self::io(
            path,
            OpenOptions::new().write(true).create_new(true).open(&host),
        )?;
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<(), SessionError> {
        let host = self.resolve(path)?;
        Self::io(path, fs::create_dir(&host))
    }

    fn remove_file(&self, path: &str) -> Result<(), SessionError> {
        let host = self.resolve(path)?;
        Self::io(path, fs::remove_file(&host))
    }

    fn remove_dir(&self, path: &str) -> Result<(), SessionError> {
        let host = self.resolve(path)?;
        Self::io(path, fs::remove_dir(&host))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SessionError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        Self::io(from, fs::rename(&source, &target))
    }

    fn truncate(&self, path: &str, size: u64) -> Result<(), SessionError> {
        let host = self.resolve_target(path)?;
        let file = Self::io(path, OpenOptions::new().write(true).open(&host))?;
        Self::io(path, file.set_len(size))
    }

    fn volume_info(&self) -> Result<VolumeInfo, SessionError> {
        let host = self.resolve("/")?;
        statvfs(&host).map_err(|e| SessionError::from_io("/", e))
    }

    fn is_connected(&self) -> bool {
        self.check_connected()
    }
}

#[cfg(unix)]
fn statvfs(path: &Path) -> std::io::Result<VolumeInfo> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let fragment = stat.f_frsize as u64;
    Ok(VolumeInfo {
        total_bytes: stat.f_blocks as u64 * fragment,
        free_bytes: stat.f_bavail as u64 * fragment,
        block_size: stat.f_bsize as u32,
    })
}

#[cfg(not(unix))]
fn statvfs(_path: &Path) -> std::io::Result<VolumeInfo> {
    Ok(VolumeInfo::default())
}
