// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{ChildVisitor, Chunk, Connector};
use crate::fs::{FileSystem, StdFileSystem};
use crate::path::{resolve_local, BlobPath};
use crate::Error;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// AFS connector backed by a local path tree, generic over the [`FileSystem`]
/// seam so tests can substitute a fake filesystem.
pub struct LocalConnector<FS: FileSystem = StdFileSystem> {
    root: PathBuf,
    _fs: PhantomData<FS>,
}

impl<FS: FileSystem> LocalConnector<FS> {
    /// Creates a connector rooted at `root`. The root is created lazily on
    /// first use, mirroring the rest of AFS's "no surprise side effects at
    /// construction" stance.
    #[must_use]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            _fs: PhantomData,
        }
    }

    fn resolve(&self, path: &BlobPath) -> PathBuf {
        resolve_local(&self.root, path)
    }

    fn io_read(path: &Path, e: std::io::Error) -> Error {
        Error::IoReading(path.to_path_buf(), e)
    }

    fn io_write(path: &Path, e: std::io::Error) -> Error {
        Error::IoWriting(path.to_path_buf(), e)
    }

    fn ensure_parent(path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            FS::create_dir_all(parent).map_err(|e| Self::io_write(path, e))?;
        }
        Ok(())
    }
}

impl<FS: FileSystem> Connector for LocalConnector<FS> {
    fn file_exists(&self, path: &BlobPath) -> crate::Result<bool> {
        let native = self.resolve(path);
        Ok(FS::exists(&native).map_err(|e| Self::io_read(&native, e))? && native.is_file())
    }

    fn dir_exists(&self, path: &BlobPath) -> crate::Result<bool> {
        let native = self.resolve(path);
        Ok(FS::exists(&native).map_err(|e| Self::io_read(&native, e))? && native.is_dir())
    }

    fn create_dir(&self, path: &BlobPath) -> crate::Result<()> {
        let native = self.resolve(path);
        FS::create_dir_all(&native).map_err(|e| Self::io_write(&native, e))
    }

    fn create_file(&self, path: &BlobPath) -> crate::Result<()> {
        let native = self.resolve(path);
        if FS::exists(&native).map_err(|e| Self::io_read(&native, e))? {
            return Ok(());
        }
        Self::ensure_parent(&native)?;
        FS::create_new(&native).map_err(|e| Self::io_write(&native, e))?;
        Ok(())
    }

    fn delete_file(&self, path: &BlobPath) -> crate::Result<()> {
        let native = self.resolve(path);
        FS::remove_file(&native).map_err(|e| Self::io_write(&native, e))
    }

    fn read(&self, path: &BlobPath, offset: u64, len: u64) -> crate::Result<Vec<u8>> {
        let native = self.resolve(path);
        let mut file = FS::open(&native).map_err(|e| Self::io_read(&native, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_read(&native, e))?;
        let mut buf = vec![0u8; len as usize];
        let mut total = 0usize;
        loop {
            let read_now = file
                .read(&mut buf[total..])
                .map_err(|e| Self::io_read(&native, e))?;
            if read_now == 0 {
                break;
            }
            total += read_now;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn read_into(&self, path: &BlobPath, buf: &mut [u8], offset: u64) -> crate::Result<u64> {
        let native = self.resolve(path);
        let mut file = FS::open(&native).map_err(|e| Self::io_read(&native, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Self::io_read(&native, e))?;
        let mut total = 0usize;
        loop {
            let read_now = file
                .read(&mut buf[total..])
                .map_err(|e| Self::io_read(&native, e))?;
            if read_now == 0 {
                break;
            }
            total += read_now;
            if total == buf.len() {
                break;
            }
        }
        Ok(total as u64)
    }

    fn write(&self, path: &BlobPath, chunks: &[Chunk<'_>]) -> crate::Result<u64> {
        // NOTE: truncating overwrite. Never call this for data-file appends;
        // use `append` instead, which opens in explicit append mode.
        let native = self.resolve(path);
        Self::ensure_parent(&native)?;
        let mut file = FS::create(&native).map_err(|e| Self::io_write(&native, e))?;
        let mut total = 0u64;
        for chunk in chunks {
            file.write_all(chunk).map_err(|e| Self::io_write(&native, e))?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    fn append(&self, path: &BlobPath, chunks: &[Chunk<'_>]) -> crate::Result<u64> {
        let native = self.resolve(path);
        Self::ensure_parent(&native)?;
        let mut file = FS::open_append(&native).map_err(|e| Self::io_write(&native, e))?;
        let mut total = 0u64;
        for chunk in chunks {
            file.write_all(chunk).map_err(|e| Self::io_write(&native, e))?;
            total += chunk.len() as u64;
        }
        file.flush().map_err(|e| Self::io_write(&native, e))?;
        Ok(total)
    }

    fn get_size(&self, path: &BlobPath) -> crate::Result<u64> {
        let native = self.resolve(path);
        FS::file_size(&native).map_err(|e| Self::io_read(&native, e))
    }

    fn list_files(&self, path: &BlobPath) -> crate::Result<Vec<BlobPath>> {
        let native = self.resolve(path);
        let entries = FS::read_dir(&native).map_err(|e| Self::io_read(&native, e))?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.is_dir())
            .map(|e| path.join(e.file_name().to_string_lossy().into_owned()))
            .collect())
    }

    fn list_dirs(&self, path: &BlobPath) -> crate::Result<Vec<BlobPath>> {
        let native = self.resolve(path);
        let entries = FS::read_dir(&native).map_err(|e| Self::io_read(&native, e))?;
        Ok(entries
            .into_iter()
            .filter(|e| e.is_dir())
            .map(|e| path.join(e.file_name().to_string_lossy().into_owned()))
            .collect())
    }

    fn move_file(&self, src: &BlobPath, dst: &BlobPath, overwrite: bool) -> crate::Result<()> {
        let native_src = self.resolve(src);
        let native_dst = self.resolve(dst);
        Self::ensure_parent(&native_dst)?;

        if !overwrite && FS::exists(&native_dst).map_err(|e| Self::io_write(&native_dst, e))? {
            return Err(Error::IoWriting(
                native_dst.clone(),
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "destination exists"),
            ));
        }

        // POSIX rename is atomic within one filesystem/container; crossing
        // containers (e.g. a bind-mounted backup directory) is not guaranteed
        // atomic by this connector.
        FS::rename(&native_src, &native_dst).map_err(|e| Self::io_write(&native_src, e))
    }

    fn copy_file(&self, src: &BlobPath, dst: &BlobPath, offset: u64, len: u64) -> crate::Result<u64> {
        let bytes = self.read(src, offset, len)?;
        let n = bytes.len() as u64;
        self.write(dst, &[bytes.as_slice()])?;
        Ok(n)
    }

    fn truncate(&self, path: &BlobPath, new_len: u64) -> crate::Result<()> {
        let native = self.resolve(path);
        FS::set_len(&native, new_len).map_err(|e| Self::io_write(&native, e))
    }

    fn visit_children(&self, path: &BlobPath, visitor: &mut dyn ChildVisitor) -> crate::Result<()> {
        let native = self.resolve(path);
        let entries = FS::read_dir(&native).map_err(|e| Self::io_read(&native, e))?;
        for entry in entries {
            let child = path.join(entry.file_name().to_string_lossy().into_owned());
            visitor.visit(&child, entry.is_dir());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;

    fn connector(dir: &tempfile::TempDir) -> LocalConnector<StdFileSystem> {
        LocalConnector::new(dir.path())
    }

    #[test]
    fn append_then_read_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let afs = connector(&dir);
        let path = BlobPath::parse("channel_000/channel_000_file_000001.dat");

        afs.append(&path, &[b"hello".as_slice()])?;
        afs.append(&path, &[b"world".as_slice()])?;

        assert_eq!(afs.get_size(&path)?, 10);
        assert_eq!(afs.read(&path, 0, 5)?, b"hello");
        assert_eq!(afs.read(&path, 5, 5)?, b"world");
        Ok(())
    }

    #[test]
    fn write_truncates_but_append_does_not() -> crate::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let afs = connector(&dir);
        let path = BlobPath::parse("a.dat");

        afs.write(&path, &[b"0123456789".as_slice()])?;
        assert_eq!(afs.get_size(&path)?, 10);

        afs.write(&path, &[b"ab".as_slice()])?;
        assert_eq!(afs.get_size(&path)?, 2);

        afs.append(&path, &[b"cd".as_slice()])?;
        assert_eq!(afs.get_size(&path)?, 4);
        assert_eq!(afs.read(&path, 0, 4)?, b"abcd");
        Ok(())
    }

    #[test]
    fn truncate_shrinks_file() -> crate::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let afs = connector(&dir);
        let path = BlobPath::parse("a.dat");

        afs.append(&path, &[b"0123456789".as_slice()])?;
        afs.truncate(&path, 4)?;
        assert_eq!(afs.get_size(&path)?, 4);
        assert_eq!(afs.read(&path, 0, 4)?, b"0123");
        Ok(())
    }

    #[test]
    fn list_files_and_dirs() -> crate::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let afs = connector(&dir);

        afs.create_dir(&BlobPath::parse("channel_000"))?;
        afs.append(
            &BlobPath::parse("channel_000/channel_000_file_000001.dat"),
            &[b"x".as_slice()],
        )?;

        let root = BlobPath::new(["."]);
        let dirs = afs.list_dirs(&root)?;
        assert!(dirs.iter().any(|p| p.last() == "channel_000"));

        let files = afs.list_files(&BlobPath::parse("channel_000"))?;
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[test]
    fn move_file_relocates_content() -> crate::Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let afs = connector(&dir);
        let src = BlobPath::parse("a.dat");
        let dst = BlobPath::parse("b.dat");

        afs.append(&src, &[b"payload".as_slice()])?;
        afs.move_file(&src, &dst, true)?;

        assert!(!afs.file_exists(&src)?);
        assert_eq!(afs.read(&dst, 0, 7)?, b"payload");
        Ok(())
    }
}
