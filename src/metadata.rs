// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The advisory on-disk metadata file written next to a channel's data
//! files. Authority for recovery always rests with the transaction log plus
//! the actual directory listing (§4.4); this file only speeds up startup and
//! aids debugging.

use crate::file::rewrite_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Snapshot of one data file, as last observed by the file manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileMetadata {
    pub number: u64,
    pub size: u64,
    pub data_length: u64,
    pub created: u64,
    pub last_modified: u64,
    pub is_active: bool,
}

/// The advisory `channel_{c:03}_metadata.json` document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub next_file_number: u64,
    pub last_updated: u64,
    pub file_count: usize,
    pub total_data_size: u64,
    pub files: BTreeMap<u64, FileMetadata>,
    /// Reserved slot for the root object id, set only on channel 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_oid: Option<u64>,
}

impl ChannelMetadata {
    /// Builds an empty metadata document.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_file_number: 1,
            last_updated: 0,
            file_count: 0,
            total_data_size: 0,
            files: BTreeMap::new(),
            root_oid: None,
        }
    }

    fn path(dir: &Path, channel_index: u16) -> PathBuf {
        dir.join(format!("channel_{channel_index:03}_metadata.json"))
    }

    /// Loads metadata for a channel, if present. Parse failures are treated
    /// as "missing" since this file is advisory only.
    #[must_use]
    pub fn load(dir: &Path, channel_index: u16) -> Option<Self> {
        let path = Self::path(dir, channel_index);
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Atomically rewrites the metadata file for a channel.
    pub fn save(&self, dir: &Path, channel_index: u16) -> std::io::Result<()> {
        let path = Self::path(dir, channel_index);
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        rewrite_atomic(&path, &json)
    }
}

impl Default for ChannelMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();

        let mut meta = ChannelMetadata::new();
        meta.next_file_number = 3;
        meta.files.insert(
            1,
            FileMetadata {
                number: 1,
                size: 100,
                data_length: 80,
                created: 1,
                last_modified: 2,
                is_active: true,
            },
        );
        meta.file_count = meta.files.len();
        meta.save(dir.path(), 0).unwrap();

        let loaded = ChannelMetadata::load(dir.path(), 0).unwrap();
        assert_eq!(loaded.next_file_number, 3);
        assert_eq!(loaded.files.len(), 1);
    }

    #[test]
    fn missing_metadata_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ChannelMetadata::load(dir.path(), 0).is_none());
    }
}
