//! TTL cache for device metadata
//!
//! Every attribute or listing fetched over the protocol session costs a
//! round trip to the device. The kernel asks for the same entries many
//! times in quick succession, so attributes, directory listings and
//! known-missing paths are kept for a short TTL.

use std::time::Duration;

use moka::sync::Cache;

use common::device::{DirEntry, EntryInfo};

use super::inode_table::normalize_path;
use crate::mount::CacheSettings;

#[derive(Clone)]
pub struct FileCache {
    attrs: Cache<String, EntryInfo>,
    dirs: Cache<String, Vec<DirEntry>>,
    negative: Cache<String, ()>,
    settings: CacheSettings,
}

impl FileCache {
    pub fn new(settings: CacheSettings) -> Self {
        let ttl = Duration::from_secs(settings.ttl_secs as u64);
        let negative_ttl = Duration::from_secs(settings.negative_ttl_secs as u64);

        Self {
            attrs: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(settings.max_entries)
                .build(),
            dirs: Cache::builder()
                .time_to_live(ttl)
                .max_capacity((settings.max_entries / 10).max(1))
                .build(),
            negative: Cache::builder()
                .time_to_live(negative_ttl)
                .max_capacity(settings.max_entries)
                .build(),
            settings,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn get_attr(&self, path: &str) -> Option<EntryInfo> {
        self.attrs.get(&normalize_path(path))
    }

    pub fn put_attr(&self, path: &str, info: EntryInfo) {
        let key = normalize_path(path);
        self.negative.invalidate(&key);
        self.attrs.insert(key, info);
    }

    pub fn get_dir(&self, path: &str) -> Option<Vec<DirEntry>> {
        self.dirs.get(&normalize_path(path))
    }

    pub fn put_dir(&self, path: &str, entries: Vec<DirEntry>) {
        self.dirs.insert(normalize_path(path), entries);
    }

    /// Whether `path` was recently confirmed not to exist
    pub fn is_negative(&self, path: &str) -> bool {
        self.negative.contains_key(&normalize_path(path))
    }

    pub fn put_negative(&self, path: &str) {
        let key = normalize_path(path);
        self.attrs.invalidate(&key);
        self.negative.insert(key, ());
    }

    /// Drop everything known about `path`
    pub fn invalidate(&self, path: &str) {
        let key = normalize_path(path);
        self.attrs.invalidate(&key);
        self.dirs.invalidate(&key);
        self.negative.invalidate(&key);
    }

    pub fn invalidate_all(&self) {
        self.attrs.invalidate_all();
        self.dirs.invalidate_all();
        self.negative.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            attr_count: self.attrs.entry_count(),
            dir_count: self.dirs.entry_count(),
            negative_count: self.negative.entry_count(),
        }
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub attr_count: u64,
    pub dir_count: u64,
    pub negative_count: u64,
}
