//! Protocol session seam and its value types

use std::io;
use std::time::SystemTime;

/// Kind of a device entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Attributes of a single entry on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Capacity of the device volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub block_size: u32,
}

/// Errors from a protocol session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("device disconnected")]
    Disconnected,
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Classify an IO error raised while operating on `path`
    pub fn from_io(path: &str, err: io::Error) -> Self {
        let path = path.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => SessionError::NotFound(path),
            io::ErrorKind::AlreadyExists => SessionError::AlreadyExists(path),
            io::ErrorKind::PermissionDenied => SessionError::PermissionDenied(path),
            io::ErrorKind::NotADirectory => SessionError::NotADirectory(path),
            io::ErrorKind::IsADirectory => SessionError::IsADirectory(path),
            io::ErrorKind::DirectoryNotEmpty => SessionError::NotEmpty(path),
            _ => SessionError::Io { path, source: err },
        }
    }
}

/// An open connection to the device's file access endpoint.
///
/// Paths are device-absolute and `/`-separated. A session becomes invalid
/// the moment the device detaches; from then on every call may fail with
/// [`SessionError::Disconnected`]. Implementations are called concurrently
/// from filesystem worker threads.
pub trait ProtocolSession: Send + Sync {
    fn stat(&self, path: &str) -> Result<EntryInfo, SessionError>;

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SessionError>;

    /// Read up to `size` bytes starting at `offset`
    fn read(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, SessionError>;

    /// Write `data` at `offset`, returning the number of bytes written
    fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, SessionError>;

    /// Create an empty file; fails if it already exists
    fn create(&self, path: &str) -> Result<(), SessionError>;

    fn mkdir(&self, path: &str) -> Result<(), SessionError>;

    fn remove_file(&self, path: &str) -> Result<(), SessionError>;

    fn remove_dir(&self, path: &str) -> Result<(), SessionError>;

    fn rename(&self, from: &str, to: &str) -> Result<(), SessionError>;

    fn truncate(&self, path: &str, size: u64) -> Result<(), SessionError>;

    fn volume_info(&self) -> Result<VolumeInfo, SessionError>;

    /// Whether the device behind this session is still reachable
    fn is_connected(&self) -> bool;
}
