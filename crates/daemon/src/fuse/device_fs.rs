//! FUSE filesystem backed by a device protocol session
//!
//! Every kernel request is translated into a path-based call on the
//! [`ProtocolSession`]. The path-level helpers (`lookup_child`,
//! `list_dir`, ...) return errno values directly so they can be exercised
//! without a kernel mount; the [`Filesystem`] impl only unpacks requests
//! and sends replies.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};

use common::device::{EntryInfo, EntryKind, ProtocolSession, SessionError, VolumeInfo};

use super::cache::FileCache;
use super::inode_table::{join_path, parent_path, InodeTable};
use crate::mount::{MountConfiguration, MountError};

/// Default block size when the device does not report one
const BLOCK_SIZE: u32 = 4096;

/// Longest single path component accepted
const MAX_NAME_LEN: u32 = 255;

/// Map a session error onto the errno returned to the kernel
pub fn errno(err: &SessionError) -> i32 {
    match err {
        SessionError::NotFound(_) => libc::ENOENT,
        SessionError::NotADirectory(_) => libc::ENOTDIR,
        SessionError::IsADirectory(_) => libc::EISDIR,
        SessionError::AlreadyExists(_) => libc::EEXIST,
        SessionError::NotEmpty(_) => libc::ENOTEMPTY,
        SessionError::PermissionDenied(_) => libc::EACCES,
        SessionError::InvalidPath(_) | SessionError::UnknownService(_) => libc::EINVAL,
        SessionError::Disconnected | SessionError::Io { .. } => libc::EIO,
    }
}

/// One entry of a directory listing as handed to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub ino: u64,
    pub kind: FileType,
    pub name: String,
}

pub struct DeviceFs {
    session: Arc<dyn ProtocolSession>,
    inodes: InodeTable,
    cache: FileCache,
    ttl: Duration,
    read_only: bool,
    debug: bool,
    uid: u32,
    gid: u32,
    next_fh: u64,
}

impl DeviceFs {
    /// Build the dispatch table for `session`.
    ///
    /// The session root is probed once; a session that cannot stat `/`
    /// or whose root is not a directory is rejected.
    pub fn new(
        session: Arc<dyn ProtocolSession>,
        config: &MountConfiguration,
    ) -> Result<Self, MountError> {
        let root = session.stat("/").map_err(MountError::HandlerTable)?;
        if !root.is_dir() {
            return Err(MountError::HandlerTable(SessionError::NotADirectory(
                "/".to_string(),
            )));
        }

        let cache = FileCache::new(config.cache.clone());
        cache.put_attr("/", root);

        // SAFETY: getuid/getgid cannot fail
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        Ok(Self {
            session,
            inodes: InodeTable::new(),
            cache,
            ttl: Duration::from_secs(config.cache.ttl_secs as u64),
            read_only: config.read_only,
            debug: config.debug,
            uid,
            gid,
            next_fh: 1,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn trace(&self, op: &'static str, path: &str) {
        if self.debug {
            tracing::debug!(op, path, "fuse request");
        }
    }

    fn writable(&self) -> Result<(), i32> {
        if self.read_only {
            Err(libc::EROFS)
        } else {
            Ok(())
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.inodes
            .get_path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        if name.is_empty() || name.contains('/') {
            return Err(libc::EINVAL);
        }
        if name.len() > MAX_NAME_LEN as usize {
            return Err(libc::ENAMETOOLONG);
        }
        self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
    }

    /// Attributes for `path`, from cache when fresh
    fn stat_path(&self, path: &str) -> Result<EntryInfo, i32> {
        if let Some(info) = self.cache.get_attr(path) {
            return Ok(info);
        }
        if self.cache.is_negative(path) {
            return Err(libc::ENOENT);
        }

        match self.session.stat(path) {
            Ok(info) => {
                self.cache.put_attr(path, info.clone());
                Ok(info)
            }
            Err(SessionError::NotFound(_)) => {
                self.cache.put_negative(path);
                Err(libc::ENOENT)
            }
            Err(e) => Err(errno(&e)),
        }
    }

    /// Forget cached state for `path` and the listing of its parent
    fn invalidate(&self, path: &str) {
        self.cache.invalidate(path);
        self.cache.invalidate(&parent_path(path));
    }

    fn attr(&self, ino: u64, info: &EntryInfo) -> FileAttr {
        let (kind, mut perm, nlink) = match info.kind {
            EntryKind::Directory => (FileType::Directory, 0o755, 2),
            EntryKind::File => (FileType::RegularFile, 0o644, 1),
            EntryKind::Symlink => (FileType::Symlink, 0o777, 1),
        };
        if self.read_only {
            perm &= !0o222;
        }

        FileAttr {
            ino,
            size: info.size,
            blocks: info.size.div_ceil(512),
            atime: info.modified,
            mtime: info.modified,
            ctime: info.modified,
            crtime: info.modified,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn attr_for_path(&mut self, path: &str) -> Result<FileAttr, i32> {
        let info = self.stat_path(path)?;
        let ino = self.inodes.get_or_create(path);
        Ok(self.attr(ino, &info))
    }

    pub fn lookup_child(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr, i32> {
        let path = self.child_of(parent, name)?;
        self.trace("lookup", &path);
        self.attr_for_path(&path)
    }

    pub fn attr_of(&mut self, ino: u64) -> Result<FileAttr, i32> {
        let path = self.path_of(ino)?;
        self.trace("getattr", &path);
        let info = self.stat_path(&path)?;
        Ok(self.attr(ino, &info))
    }

    /// Listing of directory `ino`, including `.` and `..`
    pub fn list_dir(&mut self, ino: u64) -> Result<Vec<Listing>, i32> {
        let path = self.path_of(ino)?;
        self.trace("readdir", &path);

        let entries = match self.cache.get_dir(&path) {
            Some(entries) => entries,
            None => {
                let entries = self.session.read_dir(&path).map_err(|e| errno(&e))?;
                self.cache.put_dir(&path, entries.clone());
                entries
            }
        };

        let parent_ino = self.inodes.get_or_create(&parent_path(&path));
        let mut listing = Vec::with_capacity(entries.len() + 2);
        listing.push(Listing {
            ino,
            kind: FileType::Directory,
            name: ".".to_string(),
        });
        listing.push(Listing {
            ino: parent_ino,
            kind: FileType::Directory,
            name: "..".to_string(),
        });
        for entry in entries {
            let child = join_path(&path, &entry.name);
            listing.push(Listing {
                ino: self.inodes.get_or_create(&child),
                kind: file_type(entry.kind),
                name: entry.name,
            });
        }
        Ok(listing)
    }

    pub fn open_handle(&mut self, ino: u64, flags: i32) -> Result<u64, i32> {
        let path = self.path_of(ino)?;
        self.trace("open", &path);
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            self.writable()?;
        }
        if flags & libc::O_TRUNC != 0 {
            self.writable()?;
            self.session.truncate(&path, 0).map_err(|e| errno(&e))?;
            self.cache.invalidate(&path);
        }

        let fh = self.next_fh;
        self.next_fh += 1;
        Ok(fh)
    }

    pub fn read_at(&mut self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        let path = self.path_of(ino)?;
        self.trace("read", &path);
        let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;
        self.session
            .read(&path, offset, size)
            .map_err(|e| errno(&e))
    }

    pub fn write_at(&mut self, ino: u64, offset: i64, data: &[u8]) -> Result<u32, i32> {
        self.writable()?;
        let path = self.path_of(ino)?;
        self.trace("write", &path);
        let offset = u64::try_from(offset).map_err(|_| libc::EINVAL)?;
        let written = self
            .session
            .write(&path, offset, data)
            .map_err(|e| errno(&e))?;
        self.cache.invalidate(&path);
        Ok(written)
    }

    pub fn create_file(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr, i32> {
        self.writable()?;
        let path = self.child_of(parent, name)?;
        self.trace("create", &path);
        self.session.create(&path).map_err(|e| errno(&e))?;
        self.invalidate(&path);
        self.attr_for_path(&path)
    }

    pub fn make_dir(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr, i32> {
        self.writable()?;
        let path = self.child_of(parent, name)?;
        self.trace("mkdir", &path);
        self.session.mkdir(&path).map_err(|e| errno(&e))?;
        self.invalidate(&path);
        self.attr_for_path(&path)
    }

    pub fn remove_file(&mut self, parent: u64, name: &OsStr) -> Result<(), i32> {
        self.writable()?;
        let path = self.child_of(parent, name)?;
        self.trace("unlink", &path);
        self.session.remove_file(&path).map_err(|e| errno(&e))?;
        self.invalidate(&path);
        self.inodes.remove_by_path(&path);
        Ok(())
    }

    pub fn remove_dir(&mut self, parent: u64, name: &OsStr) -> Result<(), i32> {
        self.writable()?;
        let path = self.child_of(parent, name)?;
        self.trace("rmdir", &path);
        self.session.remove_dir(&path).map_err(|e| errno(&e))?;
        self.invalidate(&path);
        self.inodes.remove_by_path(&path);
        Ok(())
    }

    pub fn rename_entry(
        &mut self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> Result<(), i32> {
        self.writable()?;
        let from = self.child_of(parent, name)?;
        let to = self.child_of(new_parent, new_name)?;
        self.trace("rename", &from);

        let was_dir = self.stat_path(&from).map(|i| i.is_dir()).unwrap_or(false);
        self.session.rename(&from, &to).map_err(|e| errno(&e))?;

        self.inodes.rename(&from, &to);
        if was_dir {
            // cached descendants are keyed by their old paths
            self.cache.invalidate_all();
        } else {
            self.invalidate(&from);
            self.invalidate(&to);
        }
        Ok(())
    }

    pub fn truncate(&mut self, ino: u64, size: u64) -> Result<FileAttr, i32> {
        self.writable()?;
        let path = self.path_of(ino)?;
        self.trace("truncate", &path);
        self.session.truncate(&path, size).map_err(|e| errno(&e))?;
        self.cache.invalidate(&path);
        self.attr_of(ino)
    }

    pub fn volume(&self) -> Result<VolumeInfo, i32> {
        self.trace("statfs", "/");
        self.session.volume_info().map_err(|e| errno(&e))
    }
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
    }
}

impl Filesystem for DeviceFs {
    fn destroy(&mut self) {
        tracing::debug!("Filesystem destroyed");
        self.cache.invalidate_all();
        self.inodes.clear();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_child(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr_of(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = match size {
            Some(size) => self.truncate(ino, size),
            None => self.attr_of(ino),
        };
        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listing = match self.list_dir(ino) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, entry) in listing.into_iter().enumerate().skip(skip) {
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_handle(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_at(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_at(ino, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_file(parent, name) {
            Ok(attr) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                reply.created(&self.ttl, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.make_dir(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_file(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_dir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.rename_entry(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.volume() {
            Ok(volume) => {
                let bsize = if volume.block_size == 0 {
                    BLOCK_SIZE
                } else {
                    volume.block_size
                };
                let blocks = volume.total_bytes / bsize as u64;
                let bfree = volume.free_bytes / bsize as u64;
                reply.statfs(blocks, bfree, bfree, 0, 0, bsize, MAX_NAME_LEN, bsize);
            }
            Err(e) => reply.error(e),
        }
    }
}
