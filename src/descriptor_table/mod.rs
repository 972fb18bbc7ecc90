// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Caches open OS file handles for data files so hot files don't pay
//! `open()` on every access, with an LRU eviction policy bounding the number
//! of descriptors kept alive at once.

mod lru;

use lru::LruList;
use rustc_hash::FxHashMap;
use std::{
    fs::File,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

/// Identifies a data file across all channels.
pub type FileId = (u16, u64);

struct Inner {
    table: FxHashMap<FileId, Arc<Mutex<File>>>,
    paths: FxHashMap<FileId, PathBuf>,
    lru: LruList<FileId>,
}

/// An LRU-bounded cache of open [`File`] handles, keyed by `(channel, file_number)`.
///
/// Mirrors `TableCache` in RocksDB: avoids repeated `open()` calls for files
/// that are read or appended to repeatedly, while capping total descriptors.
pub struct DescriptorTable {
    inner: RwLock<Inner>,
    limit: usize,
}

impl DescriptorTable {
    /// Creates a table that keeps at most `limit` descriptors open at once.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                table: FxHashMap::default(),
                paths: FxHashMap::default(),
                lru: LruList::with_capacity(limit.max(1)),
            }),
            limit: limit.max(1),
        }
    }

    /// Number of descriptors currently cached.
    pub fn len(&self) -> usize {
        self.inner.read().expect("lock is poisoned").table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached handle for `id`, opening and inserting it via
    /// `open` if not already cached. Refreshes recency on every access.
    pub fn get_or_open(
        &self,
        id: FileId,
        path: &PathBuf,
        open: impl FnOnce(&PathBuf) -> std::io::Result<File>,
    ) -> std::io::Result<Arc<Mutex<File>>> {
        {
            let mut lock = self.inner.write().expect("lock is poisoned");
            if let Some(handle) = lock.table.get(&id).cloned() {
                lock.lru.refresh(id);
                return Ok(handle);
            }
        }

        let file = open(path)?;
        let handle = Arc::new(Mutex::new(file));

        let mut lock = self.inner.write().expect("lock is poisoned");
        lock.table.insert(id, handle.clone());
        lock.paths.insert(id, path.clone());
        lock.lru.refresh(id);

        while lock.table.len() > self.limit {
            let Some(oldest) = lock.lru.get_least_recently_used() else {
                break;
            };
            if oldest == id {
                break;
            }
            lock.table.remove(&oldest);
            lock.paths.remove(&oldest);
        }

        Ok(handle)
    }

    /// Evicts and closes the handle for `id`, if cached.
    pub fn remove(&self, id: FileId) {
        let mut lock = self.inner.write().expect("lock is poisoned");
        lock.table.remove(&id);
        lock.paths.remove(&id);
        lock.lru.remove(&id);
    }

    /// Closes all cached handles.
    pub fn clear(&self) {
        let mut lock = self.inner.write().expect("lock is poisoned");
        lock.table.clear();
        lock.paths.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used_beyond_limit() {
        let dir = tempfile::tempdir().unwrap();
        let table = DescriptorTable::new(2);

        let mk = |n: u64| dir.path().join(format!("f{n}.dat"));
        for n in 1..=3 {
            std::fs::write(mk(n), b"x").unwrap();
        }

        table
            .get_or_open((0, 1), &mk(1), |p| File::open(p))
            .unwrap();
        table
            .get_or_open((0, 2), &mk(2), |p| File::open(p))
            .unwrap();
        assert_eq!(table.len(), 2);

        table
            .get_or_open((0, 3), &mk(3), |p| File::open(p))
            .unwrap();
        assert_eq!(table.len(), 2);

        table.remove((0, 3));
        table.remove((0, 2));
        table.remove((0, 1));
        assert!(table.is_empty());
    }
}
