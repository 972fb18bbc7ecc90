// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The file manager (C4): the single writer for one channel. Orchestrates
//! stores into the current data file, rolls over at the size limit, and
//! commits/rolls back atomically against the transaction log.

use crate::data_file::DataFile;
use crate::descriptor_table::DescriptorTable;
use crate::entity::{EntityChain, EntityHandle};
use crate::file_evaluator::{FileEvaluator, WriteController};
use crate::fs::{FileSystem, StdFileSystem};
use crate::metadata::{ChannelMetadata, FileMetadata};
use crate::pending_write::PendingWrite;
use crate::transaction_log::TransactionLog;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn data_filename(channel_index: u16, file_number: u64) -> String {
    format!("channel_{channel_index:03}_file_{file_number:06}.dat")
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A point-in-time snapshot of one data file, returned by [`FileManager::read_storage`].
#[derive(Clone, Debug)]
pub struct DataFileSnapshot {
    pub file_number: u64,
    pub total_length: u64,
    pub data_length: u64,
    pub committed_length: u64,
}

/// Per-channel snapshot built by [`FileManager::read_storage`].
#[derive(Clone, Debug)]
pub struct ChannelInventory {
    pub channel_index: u16,
    pub files: Vec<DataFileSnapshot>,
}

struct WriteState<FS: FileSystem> {
    files: BTreeMap<u64, Arc<DataFile<FS>>>,
    current_file_number: u64,
    pending_writes: Vec<PendingWrite>,
    pending_txn: Option<u64>,
}

/// Orchestrates one channel's append-only storage: single writer, many readers.
pub struct FileManager<FS: FileSystem = StdFileSystem> {
    channel_index: u16,
    dir: PathBuf,
    descriptor_table: Arc<DescriptorTable>,
    evaluator: FileEvaluator,
    write_controller: WriteController,
    transaction_log: TransactionLog<FS>,
    next_file_number: AtomicU64,
    state: Mutex<WriteState<FS>>,
    root_oid: Mutex<Option<u64>>,
    running: std::sync::atomic::AtomicBool,
    _fs: PhantomData<FS>,
}

impl<FS: FileSystem> FileManager<FS> {
    /// Opens a channel's storage: replays its transaction log, reconciles
    /// disk state, and establishes (or creates) the current data file.
    pub fn open(
        channel_index: u16,
        dir: &Path,
        descriptor_table: Arc<DescriptorTable>,
        evaluator: FileEvaluator,
        write_controller: WriteController,
    ) -> Result<Self> {
        FS::create_dir_all(dir).map_err(|e| Error::Initialization(e.to_string()))?;

        let transaction_log = TransactionLog::<FS>::open(channel_index, dir)?
            .with_max_size(evaluator.transaction_file_max_size);
        let report = transaction_log.recover()?;

        // Discover data files actually on disk; the log plus directory
        // listing are authoritative, the metadata file is advisory only.
        let mut on_disk: BTreeMap<u64, u64> = BTreeMap::new();
        if let Ok(entries) = FS::read_dir(dir) {
            let prefix = format!("channel_{channel_index:03}_file_");
            for entry in entries {
                if entry.is_dir() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(rest) = name.strip_prefix(&prefix).and_then(|r| r.strip_suffix(".dat")) {
                        if let Ok(number) = rest.parse::<u64>() {
                            let size = FS::file_size(&entry.path()).unwrap_or(0);
                            on_disk.insert(number, size);
                        }
                    }
                }
            }
        }

        for file_number in &report.deletions {
            if on_disk.contains_key(file_number) {
                let path = dir.join(data_filename(channel_index, *file_number));
                FS::remove_file(&path).map_err(|e| Error::Initialization(e.to_string()))?;
                on_disk.remove(file_number);
            }
        }

        let mut files = BTreeMap::new();
        for (&number, &size) in &on_disk {
            let length = report.truncations.get(&number).copied().unwrap_or(size);
            if length < size {
                FS::set_len(&dir.join(data_filename(channel_index, number)), length)
                    .map_err(|e| Error::Initialization(e.to_string()))?;
            }
            let file = Arc::new(DataFile::<FS>::from_existing(
                channel_index,
                number,
                dir,
                descriptor_table.clone(),
                length,
            ));
            files.insert(number, file);
        }

        let max_known = report.max_committed_file_number.max(on_disk.keys().copied().max().unwrap_or(0));

        let current_file_number = if files.is_empty() {
            let number = max_known + 1;
            let file = Arc::new(DataFile::<FS>::new(channel_index, number, dir, descriptor_table.clone()));
            file.ensure_exists().map_err(|e| Error::Initialization(e.to_string()))?;
            files.insert(number, file);
            number
        } else {
            *files.keys().next_back().expect("non-empty")
        };

        let manager = Self {
            channel_index,
            dir: dir.to_path_buf(),
            descriptor_table,
            evaluator,
            write_controller,
            transaction_log,
            next_file_number: AtomicU64::new(max_known.max(current_file_number) + 1),
            state: Mutex::new(WriteState {
                files,
                current_file_number,
                pending_writes: vec![],
                pending_txn: None,
            }),
            root_oid: Mutex::new(ChannelMetadata::load(dir, channel_index).and_then(|m| m.root_oid)),
            running: std::sync::atomic::AtomicBool::new(true),
            _fs: PhantomData,
        };

        manager.refresh_metadata()?;
        Ok(manager)
    }

    /// Sets the reserved root-object slot and rewrites the metadata file.
    /// Used only by channel 0, via `store_root`.
    pub fn set_root_oid(&self, oid: u64) -> Result<()> {
        *self.root_oid.lock().expect("lock is poisoned") = Some(oid);
        self.refresh_metadata()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Appends each chunk (in order) to the current data file, rolling over
    /// to a fresh file whenever the next write would exceed `file_max_size`.
    /// Returns the byte offset each chunk starts at. Does not commit: call
    /// [`Self::commit_write`] or [`Self::rollback_write`] next.
    pub fn store_chunks(&self, chunks: &[&[u8]]) -> Result<Vec<u64>> {
        self.ensure_running()?;
        for chunk in chunks {
            self.evaluator.validate_chunk_size(chunk.len() as u64)?;
        }

        let mut state = self.state.lock().expect("lock is poisoned");
        let txn_id = match state.pending_txn {
            Some(id) => id,
            None => {
                let id = self.transaction_log.begin()?;
                state.pending_txn = Some(id);
                id
            }
        };

        let mut positions = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            if self
                .evaluator
                .needs_rollover(state.current_file().total_length(), chunk.len() as u64)
            {
                self.roll_over(&mut state, txn_id)?;
            }

            let file = state.current_file();
            match file.append(chunk) {
                Ok(position) => {
                    state.pending_writes.push(PendingWrite {
                        file_number: file.file_number(),
                        original_length: position,
                        write_position: position,
                        chunk_len: chunk.len() as u64,
                        timestamp_ns: 0,
                    });
                    self.transaction_log
                        .log_store(txn_id, file.file_number(), position, chunk.len() as u64, vec![])?;
                    positions.push(position);
                }
                Err(e) => {
                    drop(state);
                    let _ = self.rollback_write();
                    return Err(e);
                }
            }
        }

        Ok(positions)
    }

    fn roll_over(&self, state: &mut WriteState<FS>, txn_id: u64) -> Result<()> {
        let number = self.next_file_number.fetch_add(1, Ordering::SeqCst);
        let filename = data_filename(self.channel_index, number);
        self.transaction_log.log_create(txn_id, number, &filename)?;

        let file = Arc::new(DataFile::<FS>::new(
            self.channel_index,
            number,
            &self.dir,
            self.descriptor_table.clone(),
        ));
        file.ensure_exists()?;
        state.files.insert(number, file);
        state.current_file_number = number;
        Ok(())
    }

    /// Flushes and commits every file touched since the last commit, writes
    /// the `Commit` record, and refreshes the advisory metadata file.
    pub fn commit_write(&self) -> Result<()> {
        self.ensure_running()?;
        let mut state = self.state.lock().expect("lock is poisoned");

        let Some(txn_id) = state.pending_txn.take() else {
            return Ok(());
        };

        let mut touched: Vec<u64> = state.pending_writes.iter().map(|p| p.file_number).collect();
        touched.sort_unstable();
        touched.dedup();

        for number in &touched {
            let file = state.files.get(number).expect("touched file must exist").clone();
            file.flush_and_sync()?;
            file.commit_state();
        }

        for write in &state.pending_writes {
            if let Some(file) = state.files.get(&write.file_number) {
                file.append_entry(EntityHandle {
                    file_number: write.file_number,
                    position: write.write_position,
                    length: write.chunk_len,
                });
            }
        }

        self.transaction_log.commit(txn_id)?;
        state.pending_writes.clear();
        drop(state);

        self.refresh_metadata()?;
        Ok(())
    }

    /// Undoes every pending write since the last commit, in reverse order,
    /// and logs a `Rollback` record.
    pub fn rollback_write(&self) -> Result<()> {
        self.ensure_running()?;
        let mut state = self.state.lock().expect("lock is poisoned");

        let Some(txn_id) = state.pending_txn.take() else {
            return Ok(());
        };

        let pending = std::mem::take(&mut state.pending_writes);
        for write in pending.into_iter().rev() {
            if let Some(file) = state.files.get(&write.file_number) {
                file.truncate(write.rollback_length())?;
            }
        }

        self.transaction_log.rollback(txn_id)?;

        let current = state.current_file().clone();
        drop(state);
        current.reset_to_last_committed_state()?;

        self.refresh_metadata()?;
        Ok(())
    }

    /// Builds a snapshot of every known data file. Entity parsing is left to
    /// the (out-of-scope) object marshalling layer; only offsets/lengths the
    /// engine itself tracks are returned here.
    pub fn read_storage(&self) -> ChannelInventory {
        let state = self.state.lock().expect("lock is poisoned");
        let files = state
            .files
            .values()
            .map(|f| DataFileSnapshot {
                file_number: f.file_number(),
                total_length: f.total_length(),
                data_length: f.data_length(),
                committed_length: f.committed_length(),
            })
            .collect();
        ChannelInventory {
            channel_index: self.channel_index,
            files,
        }
    }

    /// Invokes `visitor` once per known data file, in file-number order.
    pub fn iterate_storage_files(&self, mut visitor: impl FnMut(&Arc<DataFile<FS>>)) {
        let state = self.state.lock().expect("lock is poisoned");
        for file in state.files.values() {
            visitor(file);
        }
    }

    /// Time-bounded integrity sweep: validates the size invariant on each
    /// file, trial-reads its first page, and cross-checks against the
    /// advisory metadata file. Returns `false` if `budget` elapses first.
    pub fn incremental_file_cleanup_check(&self, budget: Duration) -> Result<bool> {
        let start = Instant::now();
        let state = self.state.lock().expect("lock is poisoned");

        let on_disk_numbers: std::collections::HashSet<u64> = state.files.keys().copied().collect();
        let metadata = ChannelMetadata::load(&self.dir, self.channel_index);
        if let Some(meta) = &metadata {
            let meta_numbers: std::collections::HashSet<u64> = meta.files.keys().copied().collect();
            if meta_numbers != on_disk_numbers {
                log::warn!(
                    "channel {} metadata file disagrees with on-disk file set",
                    self.channel_index
                );
            }
        }

        for file in state.files.values() {
            if start.elapsed() >= budget {
                return Ok(false);
            }

            if file.data_length() > file.total_length() {
                return Err(Error::Consistency(format!(
                    "file {} has data_length {} > total_length {}",
                    file.file_number(),
                    file.data_length(),
                    file.total_length()
                )));
            }

            let mut page = [0u8; 4096];
            let _ = file.read(&mut page, 0);
        }

        Ok(true)
    }

    /// Closes and forgets every known file (used on shutdown and in tests).
    pub fn reset(&self) {
        self.running.store(false, Ordering::Release);
        let mut state = self.state.lock().expect("lock is poisoned");
        for number in state.files.keys().copied().collect::<Vec<_>>() {
            self.descriptor_table.remove((self.channel_index, number));
        }
        state.files.clear();
        state.pending_writes.clear();
        state.pending_txn = None;
    }

    /// Rewrites the advisory `channel_{c:03}_metadata.json` file from current in-memory state.
    pub fn refresh_metadata(&self) -> Result<()> {
        let state = self.state.lock().expect("lock is poisoned");
        let mut meta = ChannelMetadata::new();
        meta.next_file_number = self.next_file_number.load(Ordering::Acquire);
        meta.last_updated = now_secs();

        for file in state.files.values() {
            meta.files.insert(
                file.file_number(),
                FileMetadata {
                    number: file.file_number(),
                    size: file.total_length(),
                    data_length: file.data_length(),
                    created: meta.last_updated,
                    last_modified: meta.last_updated,
                    is_active: file.file_number() == state.current_file_number,
                },
            );
        }
        meta.file_count = meta.files.len();
        meta.total_data_size = meta.files.values().map(|f| f.size).sum();
        meta.root_oid = *self.root_oid.lock().expect("lock is poisoned");

        drop(state);
        meta.save(&self.dir, self.channel_index)
            .map_err(|e| Error::IoWriting(self.dir.clone(), e))
    }

    /// The channel this manager owns.
    #[must_use]
    pub fn channel_index(&self) -> u16 {
        self.channel_index
    }

    /// Directory this channel's files live under.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Looks up a known data file by number.
    pub fn file(&self, file_number: u64) -> Option<Arc<DataFile<FS>>> {
        self.state.lock().expect("lock is poisoned").files.get(&file_number).cloned()
    }

    /// All known file numbers, in order.
    pub fn file_numbers(&self) -> Vec<u64> {
        self.state.lock().expect("lock is poisoned").files.keys().copied().collect()
    }

    /// The gatekeeper consulted before destructive maintenance runs.
    #[must_use]
    pub fn write_controller(&self) -> WriteController {
        self.write_controller
    }

    /// The rollover/dissolving policy this channel uses.
    #[must_use]
    pub fn evaluator(&self) -> FileEvaluator {
        self.evaluator
    }

    /// Removes a file from the in-memory inventory after housekeeping has
    /// deleted it on disk (e.g. after a consolidation group is retired).
    pub fn forget_file(&self, file_number: u64) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.files.remove(&file_number);
        self.descriptor_table.remove((self.channel_index, file_number));
    }

    /// Registers a file that housekeeping created directly (e.g. the target
    /// of a consolidation merge) into the in-memory inventory.
    pub fn adopt_file(&self, file: Arc<DataFile<FS>>) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.files.insert(file.file_number(), file);
    }

    /// Allocates the next file number without creating a file, for callers
    /// (e.g. consolidation) that build a file directly.
    pub fn allocate_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Merges `source_numbers` into a freshly created file: every source's
    /// bytes are transferred (logged as `Transfer` records) into the new
    /// file, the sources are then deleted, and the whole thing commits as
    /// one transaction. Refuses if any source file currently has readers.
    ///
    /// Returns the new file's number.
    pub fn consolidate_group(&self, source_numbers: &[u64]) -> Result<u64> {
        self.ensure_running()?;
        self.write_controller.validate_cleanup_enabled()?;

        let mut state = self.state.lock().expect("lock is poisoned");

        let sources: Vec<Arc<DataFile<FS>>> = source_numbers
            .iter()
            .map(|n| {
                state
                    .files
                    .get(n)
                    .cloned()
                    .ok_or_else(|| Error::Consistency(format!("unknown file {n} in consolidation group")))
            })
            .collect::<Result<_>>()?;

        for source in &sources {
            if source.user_count() > 0 {
                return Err(Error::FileInUse(source.file_number()));
            }
        }

        let txn_id = self.transaction_log.begin()?;

        let new_number = self.next_file_number.fetch_add(1, Ordering::SeqCst);
        let filename = data_filename(self.channel_index, new_number);
        self.transaction_log.log_create(txn_id, new_number, &filename)?;

        let dst = Arc::new(DataFile::<FS>::new(
            self.channel_index,
            new_number,
            &self.dir,
            self.descriptor_table.clone(),
        ));
        dst.ensure_exists()?;

        let mut relocated = Vec::new();
        for source in &sources {
            for entry in source.live_entries() {
                let mut buf = vec![0u8; entry.length as usize];
                source.read(&mut buf, entry.position)?;

                let dst_offset = dst.append(&buf)?;
                self.transaction_log.log_transfer(
                    txn_id,
                    source.file_number(),
                    entry.position,
                    entry.length,
                    new_number,
                    dst_offset,
                )?;
                relocated.push(EntityHandle {
                    file_number: new_number,
                    position: dst_offset,
                    length: entry.length,
                });
            }
        }

        dst.flush_and_sync()?;
        dst.commit_state();
        dst.add_chain_to_tail(EntityChain::from_entries(relocated));

        for source in &sources {
            self.transaction_log.log_delete(txn_id, source.file_number())?;
            source.delete()?;
        }

        self.transaction_log.commit(txn_id)?;

        for number in source_numbers {
            state.files.remove(number);
            self.descriptor_table.remove((self.channel_index, *number));
        }
        state.files.insert(new_number, dst);
        if source_numbers.contains(&state.current_file_number) {
            state.current_file_number = new_number;
        }

        drop(state);
        self.refresh_metadata()?;
        Ok(new_number)
    }
}

impl<FS: FileSystem> WriteState<FS> {
    fn current_file(&self) -> Arc<DataFile<FS>> {
        self.files
            .get(&self.current_file_number)
            .expect("current_file_number must reference a known file")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;

    fn manager(dir: &Path, evaluator: FileEvaluator) -> FileManager<StdFileSystem> {
        FileManager::open(
            0,
            dir,
            Arc::new(DescriptorTable::new(16)),
            evaluator,
            WriteController::new(true),
        )
        .unwrap()
    }

    #[test]
    fn store_then_commit_is_durable_and_readable() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let fm = manager(dir.path(), FileEvaluator::default());

        let positions = fm.store_chunks(&[b"hello", b"world"])?;
        fm.commit_write()?;

        let file = fm.file(fm.file_numbers()[0]).unwrap();
        let mut buf = [0u8; 5];
        file.read(&mut buf, positions[0])?;
        assert_eq!(&buf, b"hello");
        file.read(&mut buf, positions[1])?;
        assert_eq!(&buf, b"world");
        Ok(())
    }

    #[test]
    fn rollback_undoes_uncommitted_store() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let fm = manager(dir.path(), FileEvaluator::default());

        fm.store_chunks(&[b"abc"])?;
        fm.rollback_write()?;

        let file = fm.file(fm.file_numbers()[0]).unwrap();
        assert_eq!(file.total_length(), 0);
        Ok(())
    }

    #[test]
    fn rollover_splits_across_successive_files() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let fm = manager(dir.path(), FileEvaluator::new(16, 10 * 1024 * 1024));

        fm.store_chunks(&[b"0123456789"])?;
        fm.commit_write()?;
        fm.store_chunks(&[b"ABCDEF"])?;
        fm.commit_write()?;
        fm.store_chunks(&[b"GHIJKL"])?;
        fm.commit_write()?;

        let numbers = fm.file_numbers();
        assert_eq!(numbers.len(), 2);

        let file1 = fm.file(numbers[0]).unwrap();
        assert_eq!(file1.total_length(), 16);

        let file2 = fm.file(numbers[1]).unwrap();
        assert_eq!(file2.total_length(), 6);
        Ok(())
    }

    #[test]
    fn recovers_after_crash_before_commit() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        {
            let fm = manager(dir.path(), FileEvaluator::default());
            fm.store_chunks(&[b"abc"])?;
            // No commit: simulates a crash.
        }

        let fm = manager(dir.path(), FileEvaluator::default());
        let numbers = fm.file_numbers();
        let file = fm.file(numbers[0]).unwrap();
        assert_eq!(file.total_length(), 0);
        Ok(())
    }

    #[test]
    fn persists_across_restart() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let positions;
        {
            let fm = manager(dir.path(), FileEvaluator::default());
            positions = fm.store_chunks(&[b"hello", b"world"])?;
            fm.commit_write()?;
        }

        let fm = manager(dir.path(), FileEvaluator::default());
        let numbers = fm.file_numbers();
        let file = fm.file(numbers[0]).unwrap();
        let mut buf = [0u8; 5];
        file.read(&mut buf, positions[0])?;
        assert_eq!(&buf, b"hello");
        file.read(&mut buf, positions[1])?;
        assert_eq!(&buf, b"world");
        Ok(())
    }

    #[test]
    fn consolidate_group_merges_sources_and_deletes_them() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let fm = manager(dir.path(), FileEvaluator::new(3, 10 * 1024 * 1024));

        fm.store_chunks(&[b"AAA"])?;
        fm.commit_write()?;
        fm.store_chunks(&[b"BBB"])?;
        fm.commit_write()?;

        let sources = fm.file_numbers();
        assert_eq!(sources.len(), 2);

        let merged = fm.consolidate_group(&sources)?;

        assert_eq!(fm.file_numbers(), vec![merged]);
        let dst = fm.file(merged).unwrap();
        assert_eq!(dst.total_length(), 6);
        let mut buf = [0u8; 6];
        dst.read(&mut buf, 0)?;
        assert_eq!(&buf, b"AAABBB");
        Ok(())
    }

    #[test]
    fn random_chunk_sizes_round_trip_through_store_and_read() -> Result<()> {
        use rand::Rng;

        let dir = tempfile::tempdir().unwrap();
        let fm = manager(dir.path(), FileEvaluator::default());
        let mut rng = rand::rng();

        let mut chunks = Vec::new();
        for _ in 0..20 {
            let len = rng.random_range(1..=256);
            chunks.push((0..len).map(|_| rng.random::<u8>()).collect::<Vec<u8>>());
        }
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();

        let positions = fm.store_chunks(&refs)?;
        fm.commit_write()?;

        for (chunk, position) in chunks.iter().zip(&positions) {
            let file = fm.file(fm.file_numbers()[0]).unwrap();
            let mut buf = vec![0u8; chunk.len()];
            file.read(&mut buf, *position)?;
            assert_eq!(&buf, chunk.as_slice());
        }
        Ok(())
    }

    #[test]
    fn consolidate_group_refuses_when_source_in_use() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let fm = manager(dir.path(), FileEvaluator::default());

        fm.store_chunks(&[b"x"])?;
        fm.commit_write()?;

        let numbers = fm.file_numbers();
        let file = fm.file(numbers[0]).unwrap();
        file.register_user(1);

        assert!(matches!(
            fm.consolidate_group(&numbers),
            Err(Error::FileInUse(_))
        ));
        Ok(())
    }
}
