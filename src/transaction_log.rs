// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The per-channel transaction log (C3): a crash-safe journal of file-level
//! operations, and the recovery procedure that replays it at startup.
//!
//! Record format (little-endian), matching the wire contract:
//!
//! ```text
//! u32 record_length   // length of the bytes that follow, up to (excluding) the crc
//! u8  tag
//! u64 txn_id
//! u64 timestamp_ns
//! <tag-specific payload>
//! u32 crc32c          // over record_length..end-of-payload
//! ```

use crate::checksum::{Checksum, ChecksumBuilder};
use crate::coding::{read_string, read_u64_array, write_string, write_u64_array, Decode, DecodeError, Encode, EncodeError};
use crate::fs::{FileSystem, StdFileSystem};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{HashMap, HashSet};
use std::io::{BufReader, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const TAG_BEGIN: u8 = 1;
const TAG_CREATE: u8 = 2;
const TAG_STORE: u8 = 3;
const TAG_TRANSFER: u8 = 4;
const TAG_TRUNCATE: u8 = 5;
const TAG_DELETE: u8 = 6;
const TAG_COMMIT: u8 = 7;
const TAG_ROLLBACK: u8 = 8;

/// One entry in a channel's transaction log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionRecord {
    /// Marks the start of a transaction.
    Begin { txn_id: u64, channel: u16, timestamp_ns: u64 },
    /// A new data file is about to be materialized.
    Create { txn_id: u64, timestamp_ns: u64, file_number: u64, filename: String },
    /// Bytes were appended to a data file. `position` doubles as the file's
    /// pre-write length, since stores always append at the current end.
    Store {
        txn_id: u64,
        timestamp_ns: u64,
        file_number: u64,
        position: u64,
        length: u64,
        object_ids: Vec<u64>,
    },
    /// Entities were relocated from one file to another (consolidation).
    /// `dst_offset` doubles as the destination's pre-transfer length.
    Transfer {
        txn_id: u64,
        timestamp_ns: u64,
        src_file: u64,
        src_offset: u64,
        length: u64,
        dst_file: u64,
        dst_offset: u64,
    },
    /// A file was truncated. `original_length` is the length immediately
    /// before the truncation, needed so recovery can undo a non-committed
    /// truncate by restoring it.
    Truncate {
        txn_id: u64,
        timestamp_ns: u64,
        file_number: u64,
        original_length: u64,
        new_length: u64,
    },
    /// A file was deleted (e.g. after consolidation relocated its entities).
    Delete { txn_id: u64, timestamp_ns: u64, file_number: u64 },
    /// The transaction is durably applied.
    Commit { txn_id: u64, timestamp_ns: u64 },
    /// The transaction was abandoned; its data-file effects must be undone.
    Rollback { txn_id: u64, timestamp_ns: u64 },
}

impl TransactionRecord {
    /// The transaction this record belongs to.
    #[must_use]
    pub fn txn_id(&self) -> u64 {
        match self {
            Self::Begin { txn_id, .. }
            | Self::Create { txn_id, .. }
            | Self::Store { txn_id, .. }
            | Self::Transfer { txn_id, .. }
            | Self::Truncate { txn_id, .. }
            | Self::Delete { txn_id, .. }
            | Self::Commit { txn_id, .. }
            | Self::Rollback { txn_id, .. } => *txn_id,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Begin { .. } => TAG_BEGIN,
            Self::Create { .. } => TAG_CREATE,
            Self::Store { .. } => TAG_STORE,
            Self::Transfer { .. } => TAG_TRANSFER,
            Self::Truncate { .. } => TAG_TRUNCATE,
            Self::Delete { .. } => TAG_DELETE,
            Self::Commit { .. } => TAG_COMMIT,
            Self::Rollback { .. } => TAG_ROLLBACK,
        }
    }

    fn timestamp_ns(&self) -> u64 {
        match self {
            Self::Begin { timestamp_ns, .. }
            | Self::Create { timestamp_ns, .. }
            | Self::Store { timestamp_ns, .. }
            | Self::Transfer { timestamp_ns, .. }
            | Self::Truncate { timestamp_ns, .. }
            | Self::Delete { timestamp_ns, .. }
            | Self::Commit { timestamp_ns, .. }
            | Self::Rollback { timestamp_ns, .. } => *timestamp_ns,
        }
    }

    fn encode_payload(&self) -> std::result::Result<Vec<u8>, EncodeError> {
        let mut payload = vec![];
        match self {
            Self::Begin { channel, .. } => {
                payload.write_u16::<LittleEndian>(*channel)?;
            }
            Self::Create {
                file_number,
                filename,
                ..
            } => {
                payload.write_u64::<LittleEndian>(*file_number)?;
                write_string(&mut payload, filename)?;
            }
            Self::Store {
                file_number,
                position,
                length,
                object_ids,
                ..
            } => {
                payload.write_u64::<LittleEndian>(*file_number)?;
                payload.write_u64::<LittleEndian>(*position)?;
                payload.write_u64::<LittleEndian>(*length)?;
                write_u64_array(&mut payload, object_ids)?;
            }
            Self::Transfer {
                src_file,
                src_offset,
                length,
                dst_file,
                dst_offset,
                ..
            } => {
                payload.write_u64::<LittleEndian>(*src_file)?;
                payload.write_u64::<LittleEndian>(*src_offset)?;
                payload.write_u64::<LittleEndian>(*length)?;
                payload.write_u64::<LittleEndian>(*dst_file)?;
                payload.write_u64::<LittleEndian>(*dst_offset)?;
            }
            Self::Truncate {
                file_number,
                original_length,
                new_length,
                ..
            } => {
                payload.write_u64::<LittleEndian>(*file_number)?;
                payload.write_u64::<LittleEndian>(*original_length)?;
                payload.write_u64::<LittleEndian>(*new_length)?;
            }
            Self::Delete { file_number, .. } => {
                payload.write_u64::<LittleEndian>(*file_number)?;
            }
            Self::Commit { .. } | Self::Rollback { .. } => {}
        }
        Ok(payload)
    }
}

impl Encode for TransactionRecord {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        let mut body = vec![];
        body.write_u8(self.tag())?;
        body.write_u64::<LittleEndian>(self.txn_id())?;
        body.write_u64::<LittleEndian>(self.timestamp_ns())?;
        body.extend_from_slice(&self.encode_payload()?);

        let record_length = body.len() as u32;

        let mut checksummed = ChecksumBuilder::new();
        checksummed.update(&record_length.to_le_bytes());
        checksummed.update(&body);

        writer.write_u32::<LittleEndian>(record_length)?;
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(checksummed.finish().into_u32())?;
        Ok(())
    }
}

impl Decode for TransactionRecord {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let record_length = reader.read_u32::<LittleEndian>()?;
        let mut body = vec![0u8; record_length as usize];
        reader.read_exact(&mut body)?;
        let stored_crc = reader.read_u32::<LittleEndian>()?;

        let mut checksummed = ChecksumBuilder::new();
        checksummed.update(&record_length.to_le_bytes());
        checksummed.update(&body);
        if checksummed.finish() != Checksum::from_raw(stored_crc) {
            return Err(DecodeError::ChecksumMismatch);
        }

        let mut cursor = std::io::Cursor::new(body);
        let tag = cursor.read_u8()?;
        let txn_id = cursor.read_u64::<LittleEndian>()?;
        let timestamp_ns = cursor.read_u64::<LittleEndian>()?;

        Ok(match tag {
            TAG_BEGIN => Self::Begin {
                txn_id,
                timestamp_ns,
                channel: cursor.read_u16::<LittleEndian>()?,
            },
            TAG_CREATE => Self::Create {
                txn_id,
                timestamp_ns,
                file_number: cursor.read_u64::<LittleEndian>()?,
                filename: read_string(&mut cursor)?,
            },
            TAG_STORE => {
                let file_number = cursor.read_u64::<LittleEndian>()?;
                let position = cursor.read_u64::<LittleEndian>()?;
                let length = cursor.read_u64::<LittleEndian>()?;
                let object_ids = read_u64_array(&mut cursor)?;
                Self::Store {
                    txn_id,
                    timestamp_ns,
                    file_number,
                    position,
                    length,
                    object_ids,
                }
            }
            TAG_TRANSFER => Self::Transfer {
                txn_id,
                timestamp_ns,
                src_file: cursor.read_u64::<LittleEndian>()?,
                src_offset: cursor.read_u64::<LittleEndian>()?,
                length: cursor.read_u64::<LittleEndian>()?,
                dst_file: cursor.read_u64::<LittleEndian>()?,
                dst_offset: cursor.read_u64::<LittleEndian>()?,
            },
            TAG_TRUNCATE => Self::Truncate {
                txn_id,
                timestamp_ns,
                file_number: cursor.read_u64::<LittleEndian>()?,
                original_length: cursor.read_u64::<LittleEndian>()?,
                new_length: cursor.read_u64::<LittleEndian>()?,
            },
            TAG_DELETE => Self::Delete {
                txn_id,
                timestamp_ns,
                file_number: cursor.read_u64::<LittleEndian>()?,
            },
            TAG_COMMIT => Self::Commit { txn_id, timestamp_ns },
            TAG_ROLLBACK => Self::Rollback { txn_id, timestamp_ns },
            other => return Err(DecodeError::InvalidTag(other)),
        })
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Outcome of replaying a channel's transaction log at startup.
#[derive(Default, Debug)]
pub struct RecoveryReport {
    /// Files that must be truncated to the paired length to undo
    /// non-committed effects.
    pub truncations: HashMap<u64, u64>,
    /// Files created by a non-committed transaction; must be deleted if present.
    pub deletions: HashSet<u64>,
    /// Highest file number observed in any committed `Create` record.
    pub max_committed_file_number: u64,
}

#[derive(Default)]
struct TxnHistory {
    committed: bool,
    rolled_back: bool,
    creates: Vec<u64>,
    store_originals: Vec<(u64, u64)>,
    transfer_dst_originals: Vec<(u64, u64)>,
    truncate_originals: Vec<(u64, u64)>,
}

fn replay_records(records: &[TransactionRecord]) -> RecoveryReport {
    let mut by_txn: HashMap<u64, TxnHistory> = HashMap::new();

    for record in records {
        let history = by_txn.entry(record.txn_id()).or_default();
        match record {
            TransactionRecord::Commit { .. } => history.committed = true,
            TransactionRecord::Rollback { .. } => history.rolled_back = true,
            TransactionRecord::Create { file_number, .. } => history.creates.push(*file_number),
            TransactionRecord::Store {
                file_number,
                position,
                ..
            } => history.store_originals.push((*file_number, *position)),
            TransactionRecord::Transfer {
                dst_file,
                dst_offset,
                ..
            } => history.transfer_dst_originals.push((*dst_file, *dst_offset)),
            TransactionRecord::Truncate {
                file_number,
                original_length,
                ..
            } => history.truncate_originals.push((*file_number, *original_length)),
            TransactionRecord::Begin { .. } | TransactionRecord::Delete { .. } => {}
        }
    }

    let mut report = RecoveryReport::default();

    for history in by_txn.values() {
        if history.committed {
            report.max_committed_file_number = report
                .max_committed_file_number
                .max(history.creates.iter().copied().max().unwrap_or(0));
            continue;
        }

        // Pending or rolled back: undo every file-length effect.
        for (file_number, original_length) in history
            .store_originals
            .iter()
            .chain(history.transfer_dst_originals.iter())
            .chain(history.truncate_originals.iter())
        {
            let entry = report.truncations.entry(*file_number).or_insert(*original_length);
            *entry = (*entry).min(*original_length);
        }
        for file_number in &history.creates {
            report.deletions.insert(*file_number);
        }
    }

    report
}

struct Inner {
    writer: std::fs::File,
    current_size: u64,
    rotation_index: u64,
    pending_txns: HashSet<u64>,
}

/// Per-channel crash-recovery journal. All writes are serialized by the
/// channel's single-writer lock held in the file manager; this type adds no
/// locking of its own beyond what's needed for its internal state.
pub struct TransactionLog<FS: FileSystem = StdFileSystem> {
    channel_index: u16,
    dir: PathBuf,
    max_size: u64,
    next_txn_id: AtomicU64,
    inner: Mutex<Inner>,
    _fs: PhantomData<FS>,
}

fn log_filename(channel_index: u16) -> String {
    format!("channel_{channel_index:03}.transactions")
}

fn rotated_filename(channel_index: u16, index: u64) -> String {
    format!("channel_{channel_index:03}.transactions.{index}")
}

impl<FS: FileSystem> TransactionLog<FS> {
    /// Opens (creating if absent) the channel's current log file, and
    /// discovers the highest existing rotation index under `dir`.
    pub fn open(channel_index: u16, dir: &Path) -> Result<Self> {
        FS::create_dir_all(dir).map_err(|e| Error::Initialization(e.to_string()))?;

        let path = dir.join(log_filename(channel_index));
        let writer = FS::open_append(&path).map_err(|e| Error::Initialization(e.to_string()))?;
        let current_size = FS::file_size(&path).unwrap_or(0);

        let rotation_index = Self::discover_rotation_index(channel_index, dir);

        Ok(Self {
            channel_index,
            dir: dir.to_path_buf(),
            max_size: 10 * 1024 * 1024,
            next_txn_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                writer,
                current_size,
                rotation_index,
                pending_txns: HashSet::new(),
            }),
            _fs: PhantomData,
        })
    }

    /// Overrides the rotation threshold (`transaction_file_max_size`).
    #[must_use]
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    fn discover_rotation_index(channel_index: u16, dir: &Path) -> u64 {
        let prefix = format!("{}.", log_filename(channel_index));
        let mut max_index = 0u64;
        if let Ok(entries) = FS::read_dir(dir) {
            for entry in entries {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(suffix) = name.strip_prefix(&prefix) {
                        if let Ok(idx) = suffix.parse::<u64>() {
                            max_index = max_index.max(idx);
                        }
                    }
                }
            }
        }
        max_index
    }

    /// Starts a transaction, persisting a `Begin` record durably before returning.
    pub fn begin(&self) -> Result<u64> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let record = TransactionRecord::Begin {
            txn_id,
            channel: self.channel_index,
            timestamp_ns: now_ns(),
        };
        self.append_record(&record)?;
        self.fsync()?;
        self.inner.lock().expect("lock is poisoned").pending_txns.insert(txn_id);
        Ok(txn_id)
    }

    fn append_record(&self, record: &TransactionRecord) -> Result<()> {
        let bytes = record.encode_into_vec();
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner
            .writer
            .write_all(&bytes)
            .map_err(|e| Error::IoWriting(self.current_path(&inner), e))?;
        inner.current_size += bytes.len() as u64;
        Ok(())
    }

    fn current_path(&self, _inner: &Inner) -> PathBuf {
        self.dir.join(log_filename(self.channel_index))
    }

    fn fsync(&self) -> Result<()> {
        let inner = self.inner.lock().expect("lock is poisoned");
        inner
            .writer
            .sync_all()
            .map_err(|e| Error::IoWriting(self.current_path(&inner), e))
    }

    /// Appends a `Create` record (no fsync).
    pub fn log_create(&self, txn_id: u64, file_number: u64, filename: &str) -> Result<()> {
        self.append_record(&TransactionRecord::Create {
            txn_id,
            timestamp_ns: now_ns(),
            file_number,
            filename: filename.to_string(),
        })
    }

    /// Appends a `Store` record (no fsync).
    pub fn log_store(&self, txn_id: u64, file_number: u64, position: u64, length: u64, object_ids: Vec<u64>) -> Result<()> {
        self.append_record(&TransactionRecord::Store {
            txn_id,
            timestamp_ns: now_ns(),
            file_number,
            position,
            length,
            object_ids,
        })
    }

    /// Appends a `Transfer` record (no fsync).
    pub fn log_transfer(
        &self,
        txn_id: u64,
        src_file: u64,
        src_offset: u64,
        length: u64,
        dst_file: u64,
        dst_offset: u64,
    ) -> Result<()> {
        self.append_record(&TransactionRecord::Transfer {
            txn_id,
            timestamp_ns: now_ns(),
            src_file,
            src_offset,
            length,
            dst_file,
            dst_offset,
        })
    }

    /// Appends a `Truncate` record (no fsync).
    pub fn log_truncate(&self, txn_id: u64, file_number: u64, original_length: u64, new_length: u64) -> Result<()> {
        self.append_record(&TransactionRecord::Truncate {
            txn_id,
            timestamp_ns: now_ns(),
            file_number,
            original_length,
            new_length,
        })
    }

    /// Appends a `Delete` record (no fsync).
    pub fn log_delete(&self, txn_id: u64, file_number: u64) -> Result<()> {
        self.append_record(&TransactionRecord::Delete {
            txn_id,
            timestamp_ns: now_ns(),
            file_number,
        })
    }

    /// Appends `Commit` and fsyncs the log. Callers must have already
    /// fsynced every data file the transaction touched.
    pub fn commit(&self, txn_id: u64) -> Result<()> {
        self.append_record(&TransactionRecord::Commit { txn_id, timestamp_ns: now_ns() })?;
        self.fsync()?;
        self.inner.lock().expect("lock is poisoned").pending_txns.remove(&txn_id);
        self.maybe_rotate()?;
        Ok(())
    }

    /// Appends `Rollback` and fsyncs the log.
    pub fn rollback(&self, txn_id: u64) -> Result<()> {
        self.append_record(&TransactionRecord::Rollback { txn_id, timestamp_ns: now_ns() })?;
        self.fsync()?;
        self.inner.lock().expect("lock is poisoned").pending_txns.remove(&txn_id);
        self.maybe_rotate()?;
        Ok(())
    }

    /// Rotates the log if it exceeds `transaction_file_max_size` and no
    /// transaction is currently pending.
    fn maybe_rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        if inner.current_size <= self.max_size || !inner.pending_txns.is_empty() {
            return Ok(());
        }

        inner.rotation_index += 1;
        let rotated_path = self.dir.join(rotated_filename(self.channel_index, inner.rotation_index));
        let current_path = self.dir.join(log_filename(self.channel_index));

        FS::rename(&current_path, &rotated_path).map_err(|e| Error::IoWriting(current_path.clone(), e))?;
        inner.writer = FS::open_append(&current_path).map_err(|e| Error::IoWriting(current_path, e))?;
        inner.current_size = 0;
        Ok(())
    }

    /// Replays every record in every rotated log (oldest first) and the
    /// current log, producing the set of fix-ups recovery must apply.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut records = vec![];

        let mut rotations: Vec<u64> = vec![];
        if let Ok(entries) = FS::read_dir(&self.dir) {
            let prefix = format!("{}.", log_filename(self.channel_index));
            for entry in entries {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(suffix) = name.strip_prefix(&prefix) {
                        if let Ok(idx) = suffix.parse::<u64>() {
                            rotations.push(idx);
                        }
                    }
                }
            }
        }
        rotations.sort_unstable();

        for idx in rotations {
            let path = self.dir.join(rotated_filename(self.channel_index, idx));
            records.extend(Self::read_all_records(&path)?);
        }

        let current_path = self.dir.join(log_filename(self.channel_index));
        records.extend(Self::read_all_records(&current_path)?);

        Ok(replay_records(&records))
    }

    fn read_all_records(path: &Path) -> Result<Vec<TransactionRecord>> {
        if !FS::exists(path).unwrap_or(false) {
            return Ok(vec![]);
        }
        let file = FS::open(path).map_err(|e| Error::IoReading(path.to_path_buf(), e))?;
        let mut reader = BufReader::new(file);
        let mut records = vec![];
        loop {
            match TransactionRecord::decode_from(&mut reader) {
                Ok(record) => records.push(record),
                Err(DecodeError::UnexpectedEof) => break,
                Err(other) => {
                    return Err(Error::Consistency(format!(
                        "corrupt transaction log {}: {other}",
                        path.display()
                    )))
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;

    #[test]
    fn record_round_trips_through_encode_decode() {
        let record = TransactionRecord::Store {
            txn_id: 7,
            timestamp_ns: 123,
            file_number: 2,
            position: 100,
            length: 50,
            object_ids: vec![1, 2, 3],
        };
        let bytes = record.encode_into_vec();
        let decoded = TransactionRecord::decode_from(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn corrupted_record_fails_checksum() {
        let record = TransactionRecord::Commit { txn_id: 1, timestamp_ns: 0 };
        let mut bytes = record.encode_into_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = TransactionRecord::decode_from(&mut std::io::Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch));
    }

    #[test]
    fn commit_clears_pending_and_recovery_sees_nothing_to_undo() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::<StdFileSystem>::open(0, dir.path())?;

        let txn = log.begin()?;
        log.log_create(txn, 1, "channel_000_file_000001.dat")?;
        log.log_store(txn, 1, 0, 5, vec![])?;
        log.commit(txn)?;

        let report = log.recover()?;
        assert!(report.truncations.is_empty());
        assert!(report.deletions.is_empty());
        assert_eq!(report.max_committed_file_number, 1);
        Ok(())
    }

    #[test]
    fn uncommitted_transaction_is_undone_on_recovery() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::<StdFileSystem>::open(0, dir.path())?;

        let txn = log.begin()?;
        log.log_create(txn, 1, "channel_000_file_000001.dat")?;
        log.log_store(txn, 1, 0, 3, vec![])?;
        // crash: no commit, no rollback

        let report = log.recover()?;
        assert_eq!(report.truncations.get(&1), Some(&0));
        assert!(report.deletions.contains(&1));
        Ok(())
    }

    #[test]
    fn rolled_back_truncate_restores_original_length() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let log = TransactionLog::<StdFileSystem>::open(0, dir.path())?;

        let txn = log.begin()?;
        log.log_truncate(txn, 5, 100, 10)?;
        log.rollback(txn)?;

        let report = log.recover()?;
        assert_eq!(report.truncations.get(&5), Some(&100));
        Ok(())
    }
}
