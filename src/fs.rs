// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Low-level filesystem primitives shared by the local AFS connector and the
//! channel-local data-file/transaction-log handles. This is the `std::fs`
//! seam the rest of the engine is written against so a test double can be
//! substituted without touching the engine's I/O call sites.

use std::{
    ffi::{OsStr, OsString},
    fs,
    io,
    path::{Path, PathBuf},
};

/// Filesystem abstraction for pluggable storage backends.
pub trait FileSystem: Send + Sync {
    /// Opens an existing file for reading.
    fn open(path: &Path) -> io::Result<fs::File>;
    /// Opens a file for read/write, creating it if absent, without truncating.
    fn open_read_write(path: &Path) -> io::Result<fs::File>;
    /// Opens a file in append mode, creating it if absent.
    fn open_append(path: &Path) -> io::Result<fs::File>;
    /// Creates or truncates a file for writing.
    fn create(path: &Path) -> io::Result<fs::File>;
    /// Creates a new file, failing if it already exists.
    fn create_new(path: &Path) -> io::Result<fs::File>;
    /// Reads a file into memory.
    fn read(path: &Path) -> io::Result<Vec<u8>>;
    /// Lists directory entries.
    fn read_dir(path: &Path) -> io::Result<Vec<DirEntry>>;
    /// Creates a directory and all missing parents.
    fn create_dir_all(path: &Path) -> io::Result<()>;
    /// Removes a file.
    fn remove_file(path: &Path) -> io::Result<()>;
    /// Removes a directory and all its contents.
    fn remove_dir_all(path: &Path) -> io::Result<()>;
    /// Checks whether a path exists.
    fn exists(path: &Path) -> io::Result<bool>;
    /// Returns the size, in bytes, of an existing file.
    fn file_size(path: &Path) -> io::Result<u64>;
    /// Renames/moves a file, overwriting the destination if it exists.
    fn rename(from: &Path, to: &Path) -> io::Result<()>;
    /// Truncates a file to `len` bytes.
    fn set_len(path: &Path, len: u64) -> io::Result<()>;
}

/// Lightweight directory entry used by [`FileSystem`].
#[derive(Clone, Debug)]
pub struct DirEntry {
    path: PathBuf,
    file_name: OsString,
    is_dir: bool,
}

impl DirEntry {
    /// Returns the full path for this entry.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file name for this entry.
    #[must_use]
    pub fn file_name(&self) -> &OsStr {
        &self.file_name
    }

    /// Returns whether the entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }
}

/// `std::fs`-backed filesystem implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn open(path: &Path) -> io::Result<fs::File> {
        fs::File::open(path)
    }

    fn open_read_write(path: &Path) -> io::Result<fs::File> {
        fs::OpenOptions::new().read(true).write(true).create(true).open(path)
    }

    fn open_append(path: &Path) -> io::Result<fs::File> {
        fs::OpenOptions::new().append(true).create(true).open(path)
    }

    fn create(path: &Path) -> io::Result<fs::File> {
        fs::File::create(path)
    }

    fn create_new(path: &Path) -> io::Result<fs::File> {
        fs::OpenOptions::new().write(true).create_new(true).open(path)
    }

    fn read(path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn read_dir(path: &Path) -> io::Result<Vec<DirEntry>> {
        fs::read_dir(path)?
            .map(|entry| {
                entry.and_then(|entry| {
                    let file_name = entry.file_name();
                    let file_type = entry.file_type()?;
                    Ok(DirEntry {
                        path: entry.path(),
                        file_name,
                        is_dir: file_type.is_dir(),
                    })
                })
            })
            .collect()
    }

    fn create_dir_all(path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_file(path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir_all(path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn exists(path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn file_size(path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn rename(from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn set_len(path: &Path, len: u64) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(len)
    }
}
