//! Bidirectional inode ↔ device path mapping
//!
//! FUSE identifies entries by 64-bit inode numbers while the protocol
//! session works on paths. Inodes are handed out on first sight of a path
//! and stay stable for the lifetime of one mount.

use std::collections::HashMap;

#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table.insert("/".to_string(), Self::ROOT_INODE);
        table
    }

    fn insert(&mut self, path: String, inode: u64) {
        self.path_to_inode.insert(path.clone(), inode);
        self.inode_to_path.insert(inode, path);
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }

    /// Get or assign the inode for a path
    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let normalized = normalize_path(path);
        if let Some(&inode) = self.path_to_inode.get(&normalized) {
            return inode;
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.insert(normalized, inode);
        inode
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(&normalize_path(path)).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    /// Path of `name` inside directory inode `parent`
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.get_path(parent).map(|dir| join_path(dir, name))
    }

    /// Forget a path and everything below it
    pub fn remove_by_path(&mut self, path: &str) -> Option<u64> {
        let normalized = normalize_path(path);
        let removed = self.path_to_inode.remove(&normalized);
        if let Some(inode) = removed {
            self.inode_to_path.remove(&inode);
        }

        let prefix = format!("{}/", normalized.trim_end_matches('/'));
        let descendants: Vec<String> = self
            .path_to_inode
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for descendant in descendants {
            if let Some(inode) = self.path_to_inode.remove(&descendant) {
                self.inode_to_path.remove(&inode);
            }
        }

        removed
    }

    /// Move a path, and everything below it, keeping inode numbers.
    ///
    /// An entry already registered at the destination is forgotten.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Option<u64> {
        let old = normalize_path(old_path);
        let new = normalize_path(new_path);
        if old == new {
            return self.path_to_inode.get(&old).copied();
        }

        self.remove_by_path(&new);

        let old_prefix = format!("{}/", old);
        let moved: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(p, _)| **p == old || p.starts_with(&old_prefix))
            .map(|(p, i)| (p.clone(), *i))
            .collect();

        let mut renamed = None;
        for (path, inode) in moved {
            self.path_to_inode.remove(&path);
            let target = format!("{}{}", new, &path[old.len()..]);
            if path == old {
                renamed = Some(inode);
            }
            self.insert(target, inode);
        }
        renamed
    }

    /// Clear all mappings except root
    pub fn clear(&mut self) {
        self.path_to_inode.clear();
        self.inode_to_path.clear();
        self.next_inode = Self::ROOT_INODE + 1;
        self.insert("/".to_string(), Self::ROOT_INODE);
    }
}

/// Leading slash, no trailing slash, `/` for the root
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }

    let mut normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_path(dir);
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}
