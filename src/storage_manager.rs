// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The storage manager (C7): the top-level handle applications hold. Fans
//! requests out across channels, owns startup recovery and shutdown, and
//! exposes the single root-object commit operation.

use crate::afs::{AfsStorageType, Connector, LocalConnector};
use crate::config::StorageConfiguration;
use crate::descriptor_table::DescriptorTable;
use crate::file_evaluator::{FileEvaluator, WriteController};
use crate::file_manager::{ChannelInventory, FileManager};
use crate::fs::{FileSystem, StdFileSystem};
use crate::housekeeping::{HousekeepingBudget, HousekeepingManager, HousekeepingReport};
use crate::path::BlobPath;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn channel_dir(storage_directory: &std::path::Path, channel_index: u16) -> std::path::PathBuf {
    storage_directory.join(format!("channel_{channel_index:03}"))
}

/// A point-in-time view of every channel's files, built at startup.
#[derive(Clone, Debug)]
pub struct StorageInventory {
    pub channel_count: u16,
    pub channels: Vec<ChannelInventory>,
}

/// Top-level engine handle: one per opened storage directory.
pub struct StorageManager<FS: FileSystem + 'static = StdFileSystem> {
    config: StorageConfiguration,
    channels: Vec<Arc<FileManager<FS>>>,
    housekeeping: Arc<HousekeepingManager<FS>>,
    descriptor_table: Arc<DescriptorTable>,
    running: AtomicBool,
}

const DESCRIPTOR_TABLE_LIMIT: usize = 512;

impl<FS: FileSystem + 'static> StorageManager<FS> {
    /// Opens (creating if absent) the storage directory, recovering every
    /// channel's transaction log before returning. Fails the whole startup
    /// if any channel cannot recover.
    pub fn start(config: StorageConfiguration) -> Result<Self> {
        config.validate()?;

        // The storage directory itself is opened/created via AFS: for the
        // local backend that is a real connector call, not a bypass. Other
        // backend names are recognized by configuration but have no
        // connector implementation in this crate yet, so `use_afs` with one
        // of them fails loudly at startup instead of silently behaving like
        // a local path tree.
        if config.use_afs {
            match config.afs_storage_type {
                AfsStorageType::BlobStore => {
                    let connector = LocalConnector::<FS>::new(config.storage_directory.clone());
                    connector.create_dir(&BlobPath::new(["."]))?;
                }
                other => {
                    return Err(Error::Configuration(format!(
                        "AFS storage type '{other:?}' has no connector implementation; \
                         use_afs currently requires 'blobstore'"
                    )));
                }
            }
        } else {
            FS::create_dir_all(&config.storage_directory).map_err(|e| Error::Initialization(e.to_string()))?;
        }

        let descriptor_table = Arc::new(DescriptorTable::new(DESCRIPTOR_TABLE_LIMIT));
        let evaluator = FileEvaluator::new(config.data_file_max_size, 10 * 1024 * 1024);
        let write_controller = WriteController::new(true);

        let mut channels = Vec::with_capacity(config.channel_count as usize);
        for index in 0..config.channel_count {
            let dir = channel_dir(&config.storage_directory, index);
            let manager = FileManager::<FS>::open(index, &dir, descriptor_table.clone(), evaluator, write_controller)?;
            channels.push(Arc::new(manager));
        }

        let housekeeping = Arc::new(HousekeepingManager::new(channels.clone()));

        let manager = Self {
            config,
            channels,
            housekeeping,
            descriptor_table,
            running: AtomicBool::new(true),
        };

        if manager.config.housekeeping_on_startup {
            manager.housekeeping.perform_full_housekeeping();
        }

        manager.housekeeping.start(HousekeepingBudget {
            interval: manager.config.housekeeping_interval,
            per_run_time_budget_ns: manager.config.housekeeping_time_budget_ns,
        });

        Ok(manager)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    fn channel(&self, index: u16) -> Result<&Arc<FileManager<FS>>> {
        self.channels
            .get(index as usize)
            .ok_or_else(|| Error::Configuration(format!("channel index {index} out of range")))
    }

    /// Stores `bytes` on channel `channel_index`, committing immediately.
    /// Returns the byte offset the data was written at.
    pub fn store(&self, channel_index: u16, bytes: &[u8]) -> Result<u64> {
        self.ensure_running()?;
        let channel = self.channel(channel_index)?;
        let positions = channel.store_chunks(&[bytes])?;
        channel.commit_write()?;
        Ok(positions[0])
    }

    /// Stores `bytes` on channel 0 and records it as the graph's root object.
    /// A thin wrapper over `store_chunks` that also updates the reserved
    /// `root_oid` slot in channel 0's metadata file.
    pub fn store_root(&self, bytes: &[u8]) -> Result<u64> {
        self.ensure_running()?;
        let channel = self.channel(0)?;
        let positions = channel.store_chunks(&[bytes])?;
        channel.commit_write()?;
        let object_id = positions[0];
        channel.set_root_oid(object_id)?;
        Ok(object_id)
    }

    /// Builds a snapshot of every channel's known files.
    pub fn read_storage(&self) -> StorageInventory {
        StorageInventory {
            channel_count: self.config.channel_count,
            channels: self.channels.iter().map(|c| c.read_storage()).collect(),
        }
    }

    /// Runs one out-of-band housekeeping tick with the configured time budget.
    pub fn run_housekeeping(&self) -> HousekeepingReport {
        self.housekeeping
            .perform_time_budgeted_housekeeping(Duration::from_nanos(self.config.housekeeping_time_budget_ns))
    }

    /// Direct access to a channel's file manager, e.g. for reads.
    pub fn channel_manager(&self, channel_index: u16) -> Result<Arc<FileManager<FS>>> {
        self.channel(channel_index).map(Arc::clone)
    }

    /// Number of channels this storage directory was opened with.
    #[must_use]
    pub fn channel_count(&self) -> u16 {
        self.config.channel_count
    }

    /// The configuration this manager was started with.
    #[must_use]
    pub fn config(&self) -> &StorageConfiguration {
        &self.config
    }

    /// Quiesces writers, optionally runs a full housekeeping pass, stops the
    /// housekeeping timer, and forgets every open file handle.
    pub fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.housekeeping.stop();
        self.housekeeping.perform_full_housekeeping();

        for channel in &self.channels {
            channel.reset();
        }
        self.descriptor_table.clear();
        Ok(())
    }
}

impl<FS: FileSystem + 'static> Drop for StorageManager<FS> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;

    fn config(dir: &std::path::Path) -> StorageConfiguration {
        StorageConfiguration::builder()
            .storage_directory(dir)
            .channel_count(2)
            .housekeeping_interval(Duration::from_secs(3600))
            .build()
            .unwrap()
    }

    #[test]
    fn starts_with_one_directory_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::<StdFileSystem>::start(config(dir.path())).unwrap();
        assert_eq!(manager.channel_count(), 2);
        assert!(dir.path().join("channel_000").is_dir());
        assert!(dir.path().join("channel_001").is_dir());
    }

    #[test]
    fn store_root_updates_channel_zero_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::<StdFileSystem>::start(config(dir.path())).unwrap();

        let oid = manager.store_root(b"root-object").unwrap();

        let meta = crate::metadata::ChannelMetadata::load(&dir.path().join("channel_000"), 0).unwrap();
        assert_eq!(meta.root_oid, Some(oid));
    }

    #[test_log::test]
    fn survives_restart_with_committed_data() {
        let dir = tempfile::tempdir().unwrap();
        let position;
        {
            let manager = StorageManager::<StdFileSystem>::start(config(dir.path())).unwrap();
            position = manager.store(0, b"hello").unwrap();
            manager.shutdown().unwrap();
        }

        let manager = StorageManager::<StdFileSystem>::start(config(dir.path())).unwrap();
        let channel = manager.channel_manager(0).unwrap();
        let numbers = channel.file_numbers();
        let file = channel.file(numbers[0]).unwrap();
        let mut buf = [0u8; 5];
        file.read(&mut buf, position).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn use_afs_blobstore_creates_storage_directory_via_connector() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfiguration::builder()
            .storage_directory(dir.path().join("afs-backed"))
            .channel_count(1)
            .use_afs(true)
            .housekeeping_interval(Duration::from_secs(3600))
            .build()
            .unwrap();

        let manager = StorageManager::<StdFileSystem>::start(cfg).unwrap();
        assert!(dir.path().join("afs-backed").is_dir());
        manager.shutdown().unwrap();
    }

    #[test]
    fn use_afs_with_unimplemented_backend_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfiguration::builder()
            .storage_directory(dir.path())
            .channel_count(1)
            .use_afs(true)
            .afs_storage_type("s3")
            .unwrap()
            .afs_connection_string("s3://bucket/prefix")
            .build()
            .unwrap();

        assert!(matches!(
            StorageManager::<StdFileSystem>::start(cfg),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn operations_after_shutdown_fail() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::<StdFileSystem>::start(config(dir.path())).unwrap();
        manager.shutdown().unwrap();
        assert!(matches!(manager.store(0, b"x"), Err(Error::NotRunning)));
    }
}
