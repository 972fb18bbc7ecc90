// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Engine-wide configuration, gathered in one place the way the teacher's
//! own `Config`/`ConfigBuilder` pair does it: sensible defaults, a builder
//! for overriding them, and validation before anything is opened.

use crate::afs::AfsStorageType;
use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

fn default_storage_directory() -> PathBuf {
    std::env::temp_dir().join("nebula-store")
}

fn default_channel_count() -> u16 {
    std::thread::available_parallelism().map(|n| n.get() as u16).unwrap_or(1)
}

/// All tunables the storage engine accepts. Construct with [`Self::builder`].
#[derive(Clone, Debug)]
pub struct StorageConfiguration {
    pub storage_directory: PathBuf,
    pub channel_count: u16,
    pub entity_cache_threshold_bytes: u64,
    pub entity_cache_timeout: Duration,
    pub data_file_min_size: u64,
    pub data_file_max_size: u64,
    pub housekeeping_on_startup: bool,
    pub housekeeping_interval: Duration,
    pub housekeeping_time_budget_ns: u64,
    pub validate_on_startup: bool,
    pub backup_directory: Option<PathBuf>,
    pub use_afs: bool,
    pub afs_storage_type: AfsStorageType,
    pub afs_connection_string: Option<String>,
    pub afs_use_cache: bool,
}

impl Default for StorageConfiguration {
    fn default() -> Self {
        Self {
            storage_directory: default_storage_directory(),
            channel_count: default_channel_count(),
            entity_cache_threshold_bytes: 1024 * 1024 * 1024,
            entity_cache_timeout: Duration::from_secs(24 * 60 * 60),
            data_file_min_size: 1024 * 1024,
            data_file_max_size: crate::file_evaluator::DEFAULT_FILE_MAX_SIZE,
            housekeeping_on_startup: false,
            housekeeping_interval: Duration::from_secs(60),
            housekeeping_time_budget_ns: 10_000_000,
            validate_on_startup: true,
            backup_directory: None,
            use_afs: false,
            afs_storage_type: AfsStorageType::BlobStore,
            afs_connection_string: None,
            afs_use_cache: true,
        }
    }
}

impl StorageConfiguration {
    /// Starts a builder seeded with defaults.
    #[must_use]
    pub fn builder() -> StorageConfigurationBuilder {
        StorageConfigurationBuilder(Self::default())
    }

    /// Validates cross-field invariants the builder can't check at each
    /// individual setter call.
    pub fn validate(&self) -> Result<()> {
        if self.channel_count == 0 {
            return Err(Error::Configuration("channel_count must be >= 1".into()));
        }
        if self.data_file_min_size > self.data_file_max_size {
            return Err(Error::Configuration(format!(
                "data_file_min_size ({}) exceeds data_file_max_size ({})",
                self.data_file_min_size, self.data_file_max_size
            )));
        }
        if self.use_afs && self.afs_connection_string.is_none() && self.afs_storage_type != AfsStorageType::BlobStore
        {
            return Err(Error::Configuration(
                "afs_connection_string is required for the configured afs_storage_type".into(),
            ));
        }
        if self.use_afs && self.backup_directory.is_none() {
            // Backups are optional; nothing to validate here beyond presence checks
            // performed lazily by the backup operation itself.
        }
        Ok(())
    }
}

/// Builder for [`StorageConfiguration`], mirroring the teacher's own
/// `with_*`-method configuration style.
#[derive(Clone, Debug)]
pub struct StorageConfigurationBuilder(StorageConfiguration);

impl StorageConfigurationBuilder {
    #[must_use]
    pub fn storage_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.0.storage_directory = path.into();
        self
    }

    #[must_use]
    pub fn channel_count(mut self, count: u16) -> Self {
        self.0.channel_count = count;
        self
    }

    #[must_use]
    pub fn entity_cache_threshold_bytes(mut self, bytes: u64) -> Self {
        self.0.entity_cache_threshold_bytes = bytes;
        self
    }

    #[must_use]
    pub fn entity_cache_timeout(mut self, timeout: Duration) -> Self {
        self.0.entity_cache_timeout = timeout;
        self
    }

    #[must_use]
    pub fn data_file_min_size(mut self, bytes: u64) -> Self {
        self.0.data_file_min_size = bytes;
        self
    }

    #[must_use]
    pub fn data_file_max_size(mut self, bytes: u64) -> Self {
        self.0.data_file_max_size = bytes;
        self
    }

    #[must_use]
    pub fn housekeeping_on_startup(mut self, enabled: bool) -> Self {
        self.0.housekeeping_on_startup = enabled;
        self
    }

    #[must_use]
    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.0.housekeeping_interval = interval;
        self
    }

    #[must_use]
    pub fn housekeeping_time_budget_ns(mut self, ns: u64) -> Self {
        self.0.housekeeping_time_budget_ns = ns;
        self
    }

    #[must_use]
    pub fn validate_on_startup(mut self, enabled: bool) -> Self {
        self.0.validate_on_startup = enabled;
        self
    }

    #[must_use]
    pub fn backup_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.0.backup_directory = Some(path.into());
        self
    }

    #[must_use]
    pub fn use_afs(mut self, enabled: bool) -> Self {
        self.0.use_afs = enabled;
        self
    }

    /// Parses and sets the AFS storage type from its configuration string
    /// (`blobstore`, `nio`, `s3`, `azure.storage`, `redis`, `firestore`).
    pub fn afs_storage_type(mut self, name: &str) -> Result<Self> {
        self.0.afs_storage_type = AfsStorageType::parse(name)?;
        Ok(self)
    }

    #[must_use]
    pub fn afs_connection_string(mut self, value: impl Into<String>) -> Self {
        self.0.afs_connection_string = Some(value.into());
        self
    }

    #[must_use]
    pub fn afs_use_cache(mut self, enabled: bool) -> Self {
        self.0.afs_use_cache = enabled;
        self
    }

    /// Validates and finalizes the configuration.
    pub fn build(self) -> Result<StorageConfiguration> {
        self.0.validate()?;
        Ok(self.0)
    }
}
