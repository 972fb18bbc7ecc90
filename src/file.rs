// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Small file-level helpers shared by the metadata writer and the transaction
//! log's rotation logic.

use std::{io::Write, path::Path};

/// Magic bytes stamped at the front of the root type dictionary file.
pub const MAGIC_BYTES: [u8; 4] = [b'N', b'B', b'U', 1];

/// Atomically rewrites a file: write to a temp file in the same directory,
/// fsync it, then rename over the destination.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let folder = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    #[cfg(not(target_os = "windows"))]
    {
        fsync_directory(folder)?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync a directory handle on Windows.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_rewrite() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.txt");

        std::fs::write(&path, b"original")?;
        rewrite_atomic(&path, b"replacement")?;

        assert_eq!(std::fs::read(&path)?, b"replacement");
        Ok(())
    }
}
