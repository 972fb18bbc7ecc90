// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Policy objects (C5) consulted by the file manager and housekeeping: when
//! to roll over to a new data file, when a file is worth dissolving, and
//! whether destructive maintenance is allowed to run at all.

use crate::{Error, Result};

/// Default maximum size of a single data file: 100 MiB.
pub const DEFAULT_FILE_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Default maximum size of a transaction log before rotation: 10 MiB.
pub const DEFAULT_TRANSACTION_FILE_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Decides when a data file should roll over and when it is worth dissolving.
#[derive(Clone, Copy, Debug)]
pub struct FileEvaluator {
    /// Data files roll over strictly before a write would exceed this size.
    pub file_max_size: u64,
    /// Transaction logs rotate once they exceed this size.
    pub transaction_file_max_size: u64,
    /// Whether destructive cleanup (delete, consolidate) is permitted at all.
    pub cleanup_enabled: bool,
}

impl Default for FileEvaluator {
    fn default() -> Self {
        Self {
            file_max_size: DEFAULT_FILE_MAX_SIZE,
            transaction_file_max_size: DEFAULT_TRANSACTION_FILE_MAX_SIZE,
            cleanup_enabled: true,
        }
    }
}

impl FileEvaluator {
    /// Creates an evaluator with explicit size limits.
    #[must_use]
    pub fn new(file_max_size: u64, transaction_file_max_size: u64) -> Self {
        Self {
            file_max_size,
            transaction_file_max_size,
            cleanup_enabled: true,
        }
    }

    /// Whether the *next* write of `chunk_len` bytes would exceed
    /// `file_max_size` given the file's current `total_length`.
    #[must_use]
    pub fn needs_rollover(&self, total_length: u64, chunk_len: u64) -> bool {
        total_length + chunk_len > self.file_max_size
    }

    /// A file is worth dissolving if it has grown past the size cap, or if
    /// less than half its physical bytes are still live.
    #[must_use]
    pub fn needs_dissolving(&self, total_length: u64, data_length: u64) -> bool {
        total_length > self.file_max_size || (total_length > 0 && data_length < total_length / 2)
    }

    /// Validates that a single chunk does not exceed the maximum file size
    /// even when written into an otherwise-empty file.
    pub fn validate_chunk_size(&self, chunk_len: u64) -> Result<()> {
        if chunk_len > self.file_max_size {
            return Err(Error::CommitSizeExceeded {
                actual: chunk_len,
                maximum: self.file_max_size,
            });
        }
        Ok(())
    }
}

/// Gatekeeper flag for destructive maintenance operations (delete, consolidate).
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteController {
    /// When `false`, delete and consolidation paths must refuse to run.
    pub cleanup_enabled: bool,
}

impl WriteController {
    /// Creates a controller with cleanup enabled or disabled.
    #[must_use]
    pub fn new(cleanup_enabled: bool) -> Self {
        Self { cleanup_enabled }
    }

    /// Returns `Err(CleanupDisabled)` unless cleanup is enabled.
    pub fn validate_cleanup_enabled(&self) -> Result<()> {
        if self.cleanup_enabled {
            Ok(())
        } else {
            Err(Error::CleanupDisabled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollover_triggers_strictly_before_overflow() {
        let eval = FileEvaluator::new(16, DEFAULT_TRANSACTION_FILE_MAX_SIZE);
        assert!(!eval.needs_rollover(10, 6));
        assert!(eval.needs_rollover(10, 7));
    }

    #[test]
    fn dissolving_policy_flags_oversized_or_sparse_files() {
        let eval = FileEvaluator::new(100, DEFAULT_TRANSACTION_FILE_MAX_SIZE);
        assert!(eval.needs_dissolving(150, 150)); // over size cap
        assert!(eval.needs_dissolving(80, 30)); // under half live
        assert!(!eval.needs_dissolving(80, 60));
        assert!(!eval.needs_dissolving(0, 0));
    }

    #[test]
    fn chunk_exactly_at_limit_is_allowed_but_one_more_byte_is_not() {
        let eval = FileEvaluator::new(16, DEFAULT_TRANSACTION_FILE_MAX_SIZE);
        assert!(eval.validate_chunk_size(16).is_ok());
        assert!(matches!(
            eval.validate_chunk_size(17),
            Err(Error::CommitSizeExceeded { actual: 17, maximum: 16 })
        ));
    }

    #[test]
    fn write_controller_gates_cleanup() {
        let enabled = WriteController::new(true);
        assert!(enabled.validate_cleanup_enabled().is_ok());

        let disabled = WriteController::new(false);
        assert!(matches!(
            disabled.validate_cleanup_enabled(),
            Err(Error::CleanupDisabled)
        ));
    }
}
