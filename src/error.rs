// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::checksum::Checksum;
use std::path::PathBuf;

/// Represents errors that can occur in the storage engine.
#[derive(Debug)]
pub enum Error {
    /// Invalid configuration: bad channel count, unknown AFS type, conflicting sizes.
    Configuration(String),

    /// Could not open/create a storage directory or transaction log at startup.
    Initialization(String),

    /// Reading from a path failed.
    IoReading(PathBuf, std::io::Error),

    /// Writing to a path failed.
    IoWriting(PathBuf, std::io::Error),

    /// Appending a chunk to a data file failed.
    IoWritingChunk {
        /// The file that failed to accept the chunk.
        file_number: u64,
        /// The underlying I/O cause.
        cause: std::io::Error,
    },

    /// A data file's length disagrees with what the transaction log says it should be.
    Consistency(String),

    /// A transaction log record failed its checksum.
    InvalidChecksum {
        /// Checksum recorded in the entry.
        expected: Checksum,
        /// Checksum computed while reading.
        got: Checksum,
    },

    /// Not enough space to complete the operation.
    InsufficientSpace {
        /// Bytes required.
        required: u64,
        /// Bytes available (or buffer capacity).
        available: u64,
    },

    /// Backup requested for a channel index that does not exist.
    BackupChannelIndex(u16),

    /// Copying a file during backup failed.
    BackupCopying(String),

    /// Backup was requested but no backup directory is configured.
    BackupDisabled,

    /// Operation attempted after the storage manager has shut down.
    NotRunning,

    /// A single store exceeded the configured maximum commit size.
    CommitSizeExceeded {
        /// Size of the attempted write.
        actual: u64,
        /// Configured maximum.
        maximum: u64,
    },

    /// A write would have carried a data file's `total_length` to or past
    /// `2^63 - 1`, the largest length representable as a signed 64-bit byte
    /// offset.
    FileLengthOverflow {
        /// The file that would have overflowed.
        file_number: u64,
        /// The `total_length` the write would have produced.
        attempted: u64,
    },

    /// Operation attempted on a data file that has already been retired.
    Retired(u64),

    /// Delete/consolidation attempted while the write controller disabled cleanup.
    CleanupDisabled,

    /// A data file could not be deleted because readers still hold it open.
    FileInUse(u64),

    /// Generic I/O error without more specific context.
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::Initialization(msg) => write!(f, "initialization error: {msg}"),
            Self::IoReading(path, e) => write!(f, "failed reading {}: {e}", path.display()),
            Self::IoWriting(path, e) => write!(f, "failed writing {}: {e}", path.display()),
            Self::IoWritingChunk { file_number, cause } => {
                write!(f, "failed writing chunk to file {file_number}: {cause}")
            }
            Self::Consistency(msg) => write!(f, "consistency error: {msg}"),
            Self::InvalidChecksum { expected, got } => {
                write!(f, "checksum mismatch: expected {expected}, got {got}")
            }
            Self::InsufficientSpace {
                required,
                available,
            } => write!(
                f,
                "insufficient space: required {required}, available {available}"
            ),
            Self::BackupChannelIndex(i) => write!(f, "backup channel index mismatch: {i}"),
            Self::BackupCopying(msg) => write!(f, "backup copy failed: {msg}"),
            Self::BackupDisabled => write!(f, "backup requested but no backup directory configured"),
            Self::NotRunning => write!(f, "storage manager is not running"),
            Self::CommitSizeExceeded { actual, maximum } => {
                write!(f, "commit size {actual} exceeds maximum {maximum}")
            }
            Self::FileLengthOverflow { file_number, attempted } => write!(
                f,
                "write to file {file_number} rejected: total_length {attempted} would reach the 2^63-1 limit"
            ),
            Self::Retired(n) => write!(f, "data file {n} has been retired"),
            Self::CleanupDisabled => write!(f, "cleanup is disabled by the write controller"),
            Self::FileInUse(n) => write!(f, "data file {n} is in use and cannot be deleted"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::IoReading(_, e) | Self::IoWriting(_, e) => Some(e),
            Self::IoWritingChunk { cause, .. } => Some(cause),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Storage engine result type.
pub type Result<T> = std::result::Result<T, Error>;
