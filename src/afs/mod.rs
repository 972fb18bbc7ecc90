// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Abstract filesystem layer (AFS): maps a [`BlobPath`] onto a concrete
//! backend. A local path tree is the only connector shipped here; object
//! store connectors (S3, Azure, ...) implement the same [`Connector`] trait.

mod local;

pub use local::LocalConnector;

use crate::path::BlobPath;

/// Selects which connector backs a storage directory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AfsStorageType {
    /// In-process blob store, e.g. for embedded/unit-test use.
    BlobStore,
    /// Plain local filesystem (NIO-style).
    Nio,
    /// Amazon S3 or S3-compatible.
    S3,
    /// Azure Blob Storage.
    AzureStorage,
    /// Redis-backed blob storage.
    Redis,
    /// Google Firestore-backed blob storage.
    Firestore,
}

impl AfsStorageType {
    /// Parses the `afs_storage_type` configuration value.
    pub fn parse(name: &str) -> crate::Result<Self> {
        match name {
            "blobstore" => Ok(Self::BlobStore),
            "nio" => Ok(Self::Nio),
            "s3" => Ok(Self::S3),
            "azure.storage" => Ok(Self::AzureStorage),
            "redis" => Ok(Self::Redis),
            "firestore" => Ok(Self::Firestore),
            other => Err(crate::Error::Configuration(format!(
                "AFS storage type '{other}' is not supported"
            ))),
        }
    }
}

/// A visitor invoked once per child of a directory by [`Connector::visit_children`].
pub trait ChildVisitor {
    /// Called once for every direct child of the visited directory.
    fn visit(&mut self, path: &BlobPath, is_dir: bool);
}

impl<F: FnMut(&BlobPath, bool)> ChildVisitor for F {
    fn visit(&mut self, path: &BlobPath, is_dir: bool) {
        self(path, is_dir)
    }
}

/// A chunk to be written; `write`/`append` take a slice of chunks so callers
/// can submit multiple buffers without an intermediate concatenation.
pub type Chunk<'a> = &'a [u8];

/// The connector contract every AFS backend must implement.
///
/// Atomic multi-file operations are explicitly out of scope: a connector only
/// guarantees per-call atomicity, and only for moves within one container.
pub trait Connector: Send + Sync {
    /// Returns whether a file exists at `path`.
    fn file_exists(&self, path: &BlobPath) -> crate::Result<bool>;

    /// Returns whether a directory exists at `path`.
    fn dir_exists(&self, path: &BlobPath) -> crate::Result<bool>;

    /// Creates a directory and any missing parents.
    fn create_dir(&self, path: &BlobPath) -> crate::Result<()>;

    /// Creates an empty file, and its parent directories if needed. A no-op
    /// if the file already exists.
    fn create_file(&self, path: &BlobPath) -> crate::Result<()>;

    /// Deletes a file. Errors with `NotFound` if it does not exist.
    fn delete_file(&self, path: &BlobPath) -> crate::Result<()>;

    /// Reads `len` bytes starting at `offset`. Short reads are returned as-is
    /// (e.g. at EOF) rather than as an error.
    fn read(&self, path: &BlobPath, offset: u64, len: u64) -> crate::Result<Vec<u8>>;

    /// Reads into a caller-supplied buffer, returning the number of bytes read.
    fn read_into(&self, path: &BlobPath, buf: &mut [u8], offset: u64) -> crate::Result<u64>;

    /// Writes `chunks` starting at offset 0, truncating any existing content.
    /// Returns the total number of bytes written.
    fn write(&self, path: &BlobPath, chunks: &[Chunk<'_>]) -> crate::Result<u64>;

    /// Appends `chunks` to the end of the file, creating it if absent.
    /// Returns the total number of bytes written.
    fn append(&self, path: &BlobPath, chunks: &[Chunk<'_>]) -> crate::Result<u64>;

    /// Returns the size in bytes of the file at `path`.
    fn get_size(&self, path: &BlobPath) -> crate::Result<u64>;

    /// Lists the files directly under `path`.
    fn list_files(&self, path: &BlobPath) -> crate::Result<Vec<BlobPath>>;

    /// Lists the directories directly under `path`.
    fn list_dirs(&self, path: &BlobPath) -> crate::Result<Vec<BlobPath>>;

    /// Moves/renames a file. Overwrites the destination if `overwrite` is set.
    /// Guaranteed atomic only when `src` and `dst` share a container (e.g. the
    /// same local directory); cross-container moves may be a copy+delete.
    fn move_file(&self, src: &BlobPath, dst: &BlobPath, overwrite: bool) -> crate::Result<()>;

    /// Copies `len` bytes starting at `offset` from `src` to `dst`, returning
    /// the number of bytes copied.
    fn copy_file(&self, src: &BlobPath, dst: &BlobPath, offset: u64, len: u64) -> crate::Result<u64>;

    /// Truncates (or extends with zero bytes) the file at `path` to `new_len`.
    fn truncate(&self, path: &BlobPath, new_len: u64) -> crate::Result<()>;

    /// Returns whether the file at `path` has zero length.
    fn is_empty(&self, path: &BlobPath) -> crate::Result<bool> {
        Ok(self.get_size(path)? == 0)
    }

    /// Invokes `visitor` once per direct child of `path`.
    fn visit_children(&self, path: &BlobPath, visitor: &mut dyn ChildVisitor) -> crate::Result<()>;
}
