// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The append-only data file (C2): committed/uncommitted length tracking,
//! the entity chain, and reader reference counting that gates deletion.

use crate::descriptor_table::DescriptorTable;
use crate::entity::{EntityChain, EntityHandle};
use crate::fs::{FileSystem, StdFileSystem};
use crate::{Error, Result};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies a reader holding a data file open against concurrent deletion.
pub type UserHandle = u64;

/// Largest `total_length` a data file may reach: the greatest value
/// representable as a signed 64-bit byte offset. A write that would carry
/// `total_length` to or past this bound is rejected before any I/O happens.
const MAX_TOTAL_LENGTH: u64 = i64::MAX as u64;

fn filename(channel_index: u16, file_number: u64) -> String {
    format!("channel_{channel_index:03}_file_{file_number:06}.dat")
}

struct State {
    total_length: u64,
    data_length: u64,
    committed_length: u64,
    chain: EntityChain,
}

/// Append-only file holding serialized object chunks for one channel.
///
/// Bytes are only ever appended (never overwritten) except via [`Self::write_at`]
/// during import, which runs only while the imported region is logically
/// empty. Invariant maintained at every observation point:
/// `0 <= data_length <= committed_length <= total_length`.
pub struct DataFile<FS: FileSystem = StdFileSystem> {
    channel_index: u16,
    file_number: u64,
    path: PathBuf,
    state: Mutex<State>,
    users: Mutex<std::collections::HashSet<UserHandle>>,
    poisoned: AtomicBool,
    descriptor_table: Arc<DescriptorTable>,
    _fs: PhantomData<FS>,
}

impl<FS: FileSystem> DataFile<FS> {
    /// Builds a handle for a (possibly not-yet-existent) data file. Call
    /// [`Self::ensure_exists`] before the first write.
    #[must_use]
    pub fn new(
        channel_index: u16,
        file_number: u64,
        channel_dir: &Path,
        descriptor_table: Arc<DescriptorTable>,
    ) -> Self {
        Self {
            channel_index,
            file_number,
            path: channel_dir.join(filename(channel_index, file_number)),
            state: Mutex::new(State {
                total_length: 0,
                data_length: 0,
                committed_length: 0,
                chain: EntityChain::new(),
            }),
            users: Mutex::new(std::collections::HashSet::new()),
            poisoned: AtomicBool::new(false),
            descriptor_table,
            _fs: PhantomData,
        }
    }

    /// Reopens a handle for a file already known to exist on disk, seeding
    /// length fields from a previous scan (used during startup recovery).
    /// The entity chain itself is not persisted, so a reopened file
    /// conservatively treats every physical byte as live until GC or
    /// consolidation rebuilds chain entries for it.
    #[must_use]
    pub fn from_existing(
        channel_index: u16,
        file_number: u64,
        channel_dir: &Path,
        descriptor_table: Arc<DescriptorTable>,
        total_length: u64,
    ) -> Self {
        let file = Self::new(channel_index, file_number, channel_dir, descriptor_table);
        {
            let mut state = file.state.lock().expect("lock is poisoned");
            state.total_length = total_length;
            state.data_length = total_length;
            state.committed_length = total_length;
        }
        file
    }

    /// Channel this file belongs to.
    #[must_use]
    pub fn channel_index(&self) -> u16 {
        self.channel_index
    }

    /// Monotonic identifier within the channel.
    #[must_use]
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Path on the backing filesystem.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn id(&self) -> (u16, u64) {
        (self.channel_index, self.file_number)
    }

    /// Physical bytes persisted on disk.
    pub fn total_length(&self) -> u64 {
        self.state.lock().expect("lock is poisoned").total_length
    }

    /// Bytes still considered live by the entity chain.
    pub fn data_length(&self) -> u64 {
        self.state.lock().expect("lock is poisoned").data_length
    }

    /// Length last witnessed as durably committed.
    pub fn committed_length(&self) -> u64 {
        self.state.lock().expect("lock is poisoned").committed_length
    }

    /// Whether an unrecoverable I/O failure has disabled further writes.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Creates the parent directory and an empty file if one is not already present.
    pub fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            FS::create_dir_all(parent).map_err(|e| Error::IoWriting(self.path.clone(), e))?;
        }
        if !FS::exists(&self.path).map_err(|e| Error::IoReading(self.path.clone(), e))? {
            FS::create(&self.path).map_err(|e| Error::IoWriting(self.path.clone(), e))?;
        }
        Ok(())
    }

    /// Appends `chunk`, returning the byte offset it starts at.
    ///
    /// On I/O failure the file is truncated back to its pre-call length (or
    /// poisoned if even that fails) and `IoWritingChunk` is surfaced so the
    /// file manager can roll back the enclosing transaction.
    pub fn append(&self, chunk: &[u8]) -> Result<u64> {
        let mut state = self.state.lock().expect("lock is poisoned");
        let position = state.total_length;

        let attempted = position.saturating_add(chunk.len() as u64);
        if attempted >= MAX_TOTAL_LENGTH {
            return Err(Error::FileLengthOverflow {
                file_number: self.file_number,
                attempted,
            });
        }

        let result = (|| -> std::io::Result<()> {
            let mut file = FS::open_append(&self.path)?;
            file.write_all(chunk)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                state.total_length = position + chunk.len() as u64;
                Ok(position)
            }
            Err(cause) => {
                drop(state);
                if FS::set_len(&self.path, position).is_err() {
                    self.poisoned.store(true, Ordering::Release);
                }
                Err(Error::IoWritingChunk {
                    file_number: self.file_number,
                    cause,
                })
            }
        }
    }

    /// Writes `chunk` at an explicit `position`, used only by import. Legal
    /// only when `position <= total_length`; updates
    /// `total_length = max(old, position + chunk.len())`.
    pub fn write_at(&self, chunk: &[u8], position: u64) -> Result<()> {
        let mut state = self.state.lock().expect("lock is poisoned");
        if position > state.total_length {
            return Err(Error::Consistency(format!(
                "write_at position {position} exceeds total_length {}",
                state.total_length
            )));
        }

        let attempted = position.saturating_add(chunk.len() as u64);
        if attempted >= MAX_TOTAL_LENGTH {
            return Err(Error::FileLengthOverflow {
                file_number: self.file_number,
                attempted,
            });
        }

        let mut file =
            FS::open_read_write(&self.path).map_err(|e| Error::IoWriting(self.path.clone(), e))?;
        file.seek(SeekFrom::Start(position))
            .map_err(|e| Error::IoWriting(self.path.clone(), e))?;
        file.write_all(chunk)
            .map_err(|e| Error::IoWriting(self.path.clone(), e))?;

        state.total_length = state.total_length.max(position + chunk.len() as u64);
        Ok(())
    }

    /// Reads into `buf` starting at `position`. Short reads are returned as-is at EOF.
    pub fn read(&self, buf: &mut [u8], position: u64) -> Result<u64> {
        let path = self.path.clone();
        let handle = self.descriptor_table.get_or_open(self.id(), &path, |p| {
            FS::open(p)
        })?;
        let mut file = handle.lock().expect("lock is poisoned");
        file.seek(SeekFrom::Start(position))
            .map_err(|e| Error::IoReading(path.clone(), e))?;

        let mut total = 0usize;
        loop {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if total == buf.len() {
                        break;
                    }
                }
                Err(e) => return Err(Error::IoReading(path, e)),
            }
        }
        Ok(total as u64)
    }

    /// Truncates (or marks a shorter logical length for) the file and flushes.
    pub fn truncate(&self, new_length: u64) -> Result<()> {
        let mut state = self.state.lock().expect("lock is poisoned");

        if FS::set_len(&self.path, new_length).is_err() {
            // set_len on a nonexistent file (never appended to) is fine to ignore.
            if FS::exists(&self.path).unwrap_or(false) {
                self.descriptor_table.remove(self.id());
                return Err(Error::IoWriting(
                    self.path.clone(),
                    std::io::Error::other("truncate failed"),
                ));
            }
        }

        state.total_length = new_length;
        state.data_length = state.data_length.min(new_length);
        state.committed_length = state.committed_length.min(new_length);
        drop(state);

        self.descriptor_table.remove(self.id());
        self.flush_and_sync()
    }

    /// Durably persists the file to storage (fsync-equivalent).
    pub fn flush_and_sync(&self) -> Result<()> {
        if !FS::exists(&self.path).unwrap_or(false) {
            return Ok(());
        }
        let file = FS::open(&self.path).map_err(|e| Error::IoWriting(self.path.clone(), e))?;
        file.sync_all().map_err(|e| Error::IoWriting(self.path.clone(), e))
    }

    /// Latches `committed_length := total_length`. Leaves `data_length`
    /// alone: it tracks live bytes via the entity chain, not commit state.
    pub fn commit_state(&self) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.committed_length = state.total_length;
    }

    /// Flushes the file in place. Callers must additionally call `truncate`
    /// to discard uncommitted bytes past `committed_length`.
    pub fn reset_to_last_committed_state(&self) -> Result<()> {
        self.flush_and_sync()
    }

    /// Registers a reader, preventing the file from being deleted until it
    /// calls [`Self::unregister_user`].
    pub fn register_user(&self, user: UserHandle) {
        self.users.lock().expect("lock is poisoned").insert(user);
    }

    /// Releases a previously registered reader. `cause` is logged, not acted on.
    pub fn unregister_user(&self, user: UserHandle, cause: Option<&str>) {
        self.users.lock().expect("lock is poisoned").remove(&user);
        if let Some(cause) = cause {
            log::trace!(
                "user {user} released data file {} ({cause})",
                self.file_number
            );
        }
    }

    /// Number of readers currently holding this file open.
    pub fn user_count(&self) -> usize {
        self.users.lock().expect("lock is poisoned").len()
    }

    /// Deletes the backing file. Fails with `FileInUse` while readers hold it.
    pub fn delete(&self) -> Result<()> {
        if self.user_count() > 0 {
            return Err(Error::FileInUse(self.file_number));
        }
        self.descriptor_table.remove(self.id());
        if FS::exists(&self.path).map_err(|e| Error::IoWriting(self.path.clone(), e))? {
            FS::remove_file(&self.path).map_err(|e| Error::IoWriting(self.path.clone(), e))?;
        }
        Ok(())
    }

    /// Quarantines a poisoned file by renaming it to `*.corrupted.<timestamp>`.
    pub fn quarantine(&self) -> Result<PathBuf> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let quarantined = self.path.with_extension(format!("corrupted.{ts}"));
        self.descriptor_table.remove(self.id());
        FS::rename(&self.path, &quarantined).map_err(|e| Error::IoWriting(self.path.clone(), e))?;
        Ok(quarantined)
    }

    /// Appends one entity header to the tail of the chain. `data_length`
    /// grows by the entry's length: it is newly live physical data.
    pub fn append_entry(&self, entry: EntityHandle) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.data_length += entry.length;
        state.chain.append_entry(entry);
    }

    /// Drops a head-bound run of dead entities after garbage collection,
    /// shrinking `data_length` by the bytes just retired.
    pub fn remove_head_bound_chain(&self, new_head: Option<u64>, removed_bytes: u64) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.data_length = state.data_length.saturating_sub(removed_bytes);
        state.chain.remove_head_bound_chain(new_head, removed_bytes);
    }

    /// Splices a whole chain (e.g. from a consolidated source file) onto the
    /// tail, growing `data_length` by the incoming chain's live bytes.
    pub fn add_chain_to_tail(&self, chain: EntityChain) {
        let mut state = self.state.lock().expect("lock is poisoned");
        state.data_length += chain.iter().map(|entry| entry.length).sum::<u64>();
        state.chain.add_chain_to_tail(chain);
    }

    /// Number of entities currently chained.
    pub fn entity_count(&self) -> usize {
        self.state.lock().expect("lock is poisoned").chain.len()
    }

    /// Snapshot of the entity chain's entries, in write order.
    pub fn chain_entries(&self) -> Vec<EntityHandle> {
        self.state.lock().expect("lock is poisoned").chain.iter().copied().collect()
    }

    /// The entries consolidation should relocate: the real chain when one has
    /// been recorded, or a single entry spanning the whole file when it
    /// hasn't (e.g. a file reopened after restart, whose chain is not
    /// persisted). Never drops live bytes for lack of chain metadata.
    pub fn live_entries(&self) -> Vec<EntityHandle> {
        let state = self.state.lock().expect("lock is poisoned");
        if !state.chain.is_empty() {
            return state.chain.iter().copied().collect();
        }
        if state.total_length == 0 {
            return vec![];
        }
        vec![EntityHandle {
            file_number: self.file_number,
            position: 0,
            length: state.total_length,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;

    fn make_file(dir: &Path, n: u64) -> DataFile<StdFileSystem> {
        DataFile::new(0, n, dir, Arc::new(DescriptorTable::new(8)))
    }

    #[test]
    fn append_returns_position_and_extends_length() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let file = make_file(dir.path(), 1);
        file.ensure_exists()?;

        let p0 = file.append(b"hello")?;
        let p1 = file.append(b"world")?;

        assert_eq!(p0, 0);
        assert_eq!(p1, 5);
        assert_eq!(file.total_length(), 10);

        let mut buf = [0u8; 5];
        file.read(&mut buf, 5)?;
        assert_eq!(&buf, b"world");
        Ok(())
    }

    #[test]
    fn commit_and_rollback_update_lengths() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let file = make_file(dir.path(), 1);
        file.ensure_exists()?;

        file.append(b"committed")?;
        file.flush_and_sync()?;
        file.commit_state();
        file.append_entry(EntityHandle { file_number: 1, position: 0, length: 9 });
        assert_eq!(file.committed_length(), 9);
        assert_eq!(file.data_length(), 9);

        file.append(b"uncommitted")?;
        assert_eq!(file.total_length(), 20);

        // Simulate rollback: truncate back to committed length. No entry was
        // ever registered for the uncommitted bytes, so data_length is
        // untouched by the truncate except for the `min` safety clamp.
        file.truncate(file.committed_length())?;
        assert_eq!(file.total_length(), 9);
        assert_eq!(file.data_length(), 9);
        Ok(())
    }

    #[test]
    fn remove_head_bound_chain_shrinks_data_length() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let file = make_file(dir.path(), 1);
        file.ensure_exists()?;

        file.append(b"AAAABBBB")?;
        file.commit_state();
        file.append_entry(EntityHandle { file_number: 1, position: 0, length: 4 });
        file.append_entry(EntityHandle { file_number: 1, position: 4, length: 4 });
        assert_eq!(file.data_length(), 8);

        file.remove_head_bound_chain(Some(4), 4);
        assert_eq!(file.data_length(), 4);
        assert_eq!(file.entity_count(), 1);
        Ok(())
    }

    #[test]
    fn delete_refused_while_in_use() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let file = make_file(dir.path(), 1);
        file.ensure_exists()?;
        file.append(b"x")?;

        file.register_user(42);
        assert!(matches!(file.delete(), Err(Error::FileInUse(1))));

        file.unregister_user(42, None);
        assert!(file.delete().is_ok());
        Ok(())
    }

    #[test]
    fn write_at_extends_total_length_when_past_end() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let file = make_file(dir.path(), 1);
        file.ensure_exists()?;
        file.append(b"0123456789")?;

        file.write_at(b"AB", 4)?;
        let mut buf = [0u8; 2];
        file.read(&mut buf, 4)?;
        assert_eq!(&buf, b"AB");
        assert_eq!(file.total_length(), 10);
        Ok(())
    }

    #[test]
    fn append_near_length_bound_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let descriptor_table = Arc::new(DescriptorTable::new(8));
        let file = DataFile::<StdFileSystem>::from_existing(
            0,
            1,
            dir.path(),
            descriptor_table,
            MAX_TOTAL_LENGTH - 1,
        );
        file.ensure_exists()?;

        assert!(matches!(
            file.append(b"hi"),
            Err(Error::FileLengthOverflow { file_number: 1, .. })
        ));
        // Rejected before any write happened: length is untouched.
        assert_eq!(file.total_length(), MAX_TOTAL_LENGTH - 1);
        Ok(())
    }

    #[test]
    fn write_at_near_length_bound_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let descriptor_table = Arc::new(DescriptorTable::new(8));
        let file = DataFile::<StdFileSystem>::from_existing(
            0,
            1,
            dir.path(),
            descriptor_table,
            MAX_TOTAL_LENGTH - 1,
        );
        file.ensure_exists()?;

        assert!(matches!(
            file.write_at(b"hi", MAX_TOTAL_LENGTH - 1),
            Err(Error::FileLengthOverflow { file_number: 1, .. })
        ));
        Ok(())
    }
}
