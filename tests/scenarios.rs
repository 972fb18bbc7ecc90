// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! End-to-end scenarios exercised through the public `StorageManager` API,
//! mirroring the six storage-engine scenarios the design is validated
//! against: persist-and-restart, crash recovery, rollover, orphan GC,
//! consolidation, and reader-gated deletion.

use nebula_store::{Error, StorageConfiguration, StorageManager};
use std::time::Duration;

fn config(dir: &std::path::Path, channel_count: u16) -> StorageConfiguration {
    StorageConfiguration::builder()
        .storage_directory(dir)
        .channel_count(channel_count)
        .housekeeping_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
}

#[test]
fn persist_and_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (p0, p1);
    {
        let storage = StorageManager::<nebula_store::StdFileSystem>::start(config(dir.path(), 1)).unwrap();
        p0 = storage.store(0, b"hello").unwrap();
        p1 = storage.store(0, b"world").unwrap();
        storage.shutdown().unwrap();
    }

    let storage = StorageManager::<nebula_store::StdFileSystem>::start(config(dir.path(), 1)).unwrap();
    let channel = storage.channel_manager(0).unwrap();
    let numbers = channel.file_numbers();
    let file = channel.file(numbers[0]).unwrap();

    let mut buf = [0u8; 5];
    file.read(&mut buf, p0).unwrap();
    assert_eq!(&buf, b"hello");
    file.read(&mut buf, p1).unwrap();
    assert_eq!(&buf, b"world");
}

#[test]
fn crash_before_commit_truncates_on_recovery() {
    let dir = tempfile::tempdir().unwrap();

    {
        let storage = StorageManager::<nebula_store::StdFileSystem>::start(config(dir.path(), 1)).unwrap();
        let channel = storage.channel_manager(0).unwrap();
        channel.store_chunks(&[b"abc"]).unwrap();
        // Dropped without commit_write or a clean shutdown: simulates a crash
        // between the Store record and Commit.
        std::mem::forget(storage);
    }

    let storage = StorageManager::<nebula_store::StdFileSystem>::start(config(dir.path(), 1)).unwrap();
    let channel = storage.channel_manager(0).unwrap();
    let numbers = channel.file_numbers();
    let file = channel.file(numbers[0]).unwrap();
    assert_eq!(file.total_length(), 0);
}

#[test]
fn rollover_splits_writes_across_files() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StorageConfiguration::builder()
        .storage_directory(dir.path())
        .channel_count(1)
        .data_file_max_size(16)
        .housekeeping_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let storage = StorageManager::<nebula_store::StdFileSystem>::start(cfg).unwrap();
    let channel = storage.channel_manager(0).unwrap();

    channel.store_chunks(&[b"0123456789"]).unwrap();
    channel.commit_write().unwrap();
    channel.store_chunks(&[b"ABCDEF"]).unwrap();
    channel.commit_write().unwrap();
    channel.store_chunks(&[b"GHIJKL"]).unwrap();
    channel.commit_write().unwrap();

    let numbers = channel.file_numbers();
    assert_eq!(numbers.len(), 2);

    let file1 = channel.file(numbers[0]).unwrap();
    let mut buf1 = [0u8; 16];
    file1.read(&mut buf1, 0).unwrap();
    assert_eq!(&buf1, b"0123456789ABCDEF");

    let file2 = channel.file(numbers[1]).unwrap();
    let mut buf2 = [0u8; 6];
    file2.read(&mut buf2, 0).unwrap();
    assert_eq!(&buf2, b"GHIJKL");
}

#[test]
fn orphan_gc_reclaims_tmp_and_bak_files() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageManager::<nebula_store::StdFileSystem>::start(config(dir.path(), 1)).unwrap();
    let channel = storage.channel_manager(0).unwrap();

    std::fs::write(channel.dir().join("foo.tmp"), b"12345").unwrap();
    std::fs::write(channel.dir().join("bar.bak"), b"123").unwrap();

    let report = storage.run_housekeeping();

    assert_eq!(report.files_deleted, 2);
    assert_eq!(report.bytes_reclaimed, 8);
    assert!(!channel.dir().join("foo.tmp").exists());
    assert!(!channel.dir().join("bar.bak").exists());
}

#[test]
fn consolidation_merges_undersized_files_into_one_group() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StorageConfiguration::builder()
        .storage_directory(dir.path())
        .channel_count(1)
        .data_file_max_size(10)
        .housekeeping_interval(Duration::from_secs(3600))
        .build()
        .unwrap();
    let storage = StorageManager::<nebula_store::StdFileSystem>::start(cfg).unwrap();
    let channel = storage.channel_manager(0).unwrap();

    for byte in [b'A', b'B', b'C', b'D', b'E'] {
        channel.store_chunks(&[&[byte; 10]]).unwrap();
        channel.commit_write().unwrap();
    }
    assert_eq!(channel.file_numbers().len(), 5);

    let report = storage.run_housekeeping();

    assert_eq!(report.consolidation_groups, 1);
    assert_eq!(channel.file_numbers().len(), 1);
}

#[test]
fn reader_blocks_delete_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageManager::<nebula_store::StdFileSystem>::start(config(dir.path(), 1)).unwrap();
    let channel = storage.channel_manager(0).unwrap();

    channel.store_chunks(&[b"x"]).unwrap();
    channel.commit_write().unwrap();

    let number = channel.file_numbers()[0];
    let file = channel.file(number).unwrap();

    file.register_user(1);
    assert!(matches!(file.delete(), Err(Error::FileInUse(n)) if n == number));

    file.unregister_user(1, None);
    assert!(file.delete().is_ok());
}
