// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! NebulaStore is an embedded object-graph persistence engine: an
//! application's object graph is serialized into append-only,
//! channel-partitioned data files, mutations are appended under a
//! crash-safe transaction log, and background housekeeping reclaims orphan
//! files and consolidates undersized ones.
//!
//! This crate implements the storage engine core: the channel-partitioned
//! file manager, the transaction log and its recovery procedure, the
//! data-file/entity lifecycle, and the pluggable filesystem abstraction
//! (AFS) a storage directory is backed by. Object marshalling, query
//! execution, and configuration loading/CLI layers are external
//! collaborators and out of scope here.
//!
//! ```no_run
//! use nebula_store::{StorageConfiguration, StorageManager};
//!
//! let config = StorageConfiguration::builder()
//!     .storage_directory("./data")
//!     .channel_count(4)
//!     .build()?;
//! let storage = StorageManager::start(config)?;
//! let oid = storage.store_root(b"root object bytes")?;
//! storage.shutdown()?;
//! # Ok::<(), nebula_store::Error>(())
//! ```

#![forbid(unsafe_code)]

pub mod afs;
pub mod checksum;
pub mod coding;
pub mod config;
pub mod data_file;
pub mod descriptor_table;
pub mod entity;
pub mod error;
pub mod file;
pub mod file_evaluator;
pub mod file_manager;
pub mod fs;
pub mod housekeeping;
pub mod metadata;
pub mod path;
pub mod pending_write;
pub mod storage_manager;
pub mod transaction_log;

pub use afs::{AfsStorageType, ChildVisitor, Connector, LocalConnector};
pub use checksum::{Checksum, ChecksumBuilder};
pub use config::{StorageConfiguration, StorageConfigurationBuilder};
pub use data_file::DataFile;
pub use descriptor_table::DescriptorTable;
pub use entity::{EntityChain, EntityHandle};
pub use error::{Error, Result};
pub use file_evaluator::{FileEvaluator, WriteController};
pub use file_manager::{ChannelInventory, DataFileSnapshot, FileManager};
pub use fs::{FileSystem, StdFileSystem};
pub use housekeeping::{HousekeepingBudget, HousekeepingManager, HousekeepingReport, PhaseStatus};
pub use metadata::{ChannelMetadata, FileMetadata};
pub use path::BlobPath;
pub use pending_write::PendingWrite;
pub use storage_manager::{StorageInventory, StorageManager};
pub use transaction_log::{RecoveryReport, TransactionLog, TransactionRecord};
