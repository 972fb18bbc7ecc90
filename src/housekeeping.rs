// Copyright (c) 2024-present, the NebulaStore authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The housekeeping manager (C6): a periodic, time-budgeted task runner that
//! deletes orphan files, consolidates undersized data files, and (as a
//! placeholder) runs a third optimization phase.
//!
//! Grounded on the periodic background-thread idiom used for timer-driven
//! maintenance elsewhere in the ecosystem: `thread::Builder::spawn` running a
//! loop that sleeps for `interval` and checks a stop flag, rather than
//! anything async-runtime-specific.

use crate::file_manager::FileManager;
use crate::fs::{FileSystem, StdFileSystem};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How often housekeeping runs, and how much wall-clock time each tick may spend.
#[derive(Clone, Copy, Debug)]
pub struct HousekeepingBudget {
    pub interval: Duration,
    pub per_run_time_budget_ns: u64,
}

impl Default for HousekeepingBudget {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            per_run_time_budget_ns: 10_000_000,
        }
    }
}

/// Outcome of one sub-phase of a housekeeping tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseStatus {
    InProgress,
    Completed,
    TimeBudgetExceeded,
    Failed(String),
}

/// What one `perform_time_budgeted_housekeeping` (or full) call did.
#[derive(Clone, Debug)]
pub struct HousekeepingReport {
    pub gc: PhaseStatus,
    pub consolidation: PhaseStatus,
    pub optimization: PhaseStatus,
    pub files_deleted: u64,
    pub bytes_reclaimed: u64,
    pub consolidation_groups: u64,
}

impl HousekeepingReport {
    fn skipped() -> Self {
        Self {
            gc: PhaseStatus::InProgress,
            consolidation: PhaseStatus::InProgress,
            optimization: PhaseStatus::InProgress,
            files_deleted: 0,
            bytes_reclaimed: 0,
            consolidation_groups: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    total_gc: AtomicU64,
    total_consolidations: AtomicU64,
    total_bytes_reclaimed: AtomicU64,
    total_optimizations: AtomicU64,
    last_run_unix_secs: AtomicU64,
}

const ORPHAN_SUFFIXES: [&str; 2] = [".tmp", ".bak"];
const CONSOLIDATION_THRESHOLD: u64 = 1024 * 1024;
const CONSOLIDATION_BATCH: usize = 5;

fn is_orphan(name: &str) -> bool {
    ORPHAN_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) || name.contains(".corrupted.")
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Runs garbage collection, consolidation, and the optimization placeholder
/// across every channel on a shared time budget, either periodically in a
/// background thread or on demand.
pub struct HousekeepingManager<FS: FileSystem = StdFileSystem> {
    channels: Vec<Arc<FileManager<FS>>>,
    counters: Counters,
    running: AtomicBool,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<FS: FileSystem + 'static> HousekeepingManager<FS> {
    /// Builds a manager over the given channels. Does not start the timer.
    #[must_use]
    pub fn new(channels: Vec<Arc<FileManager<FS>>>) -> Self {
        Self {
            channels,
            counters: Counters::default(),
            running: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Total garbage-collection passes run.
    pub fn total_gc(&self) -> u64 {
        self.counters.total_gc.load(Ordering::Acquire)
    }

    /// Total consolidation groups merged.
    pub fn total_consolidations(&self) -> u64 {
        self.counters.total_consolidations.load(Ordering::Acquire)
    }

    /// Total bytes reclaimed by orphan deletion.
    pub fn total_bytes_reclaimed(&self) -> u64 {
        self.counters.total_bytes_reclaimed.load(Ordering::Acquire)
    }

    /// Unix timestamp, in seconds, of the last completed tick.
    pub fn last_run(&self) -> u64 {
        self.counters.last_run_unix_secs.load(Ordering::Acquire)
    }

    /// Runs one tick, splitting `budget` 40% GC / 40% of the remainder to
    /// consolidation / the rest to optimization. Skips (returning
    /// all-`InProgress`) if a previous tick is still running — the
    /// reentrancy guard required by the concurrency model.
    pub fn perform_time_budgeted_housekeeping(&self, budget: Duration) -> HousekeepingReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return HousekeepingReport::skipped();
        }

        let report = self.run_phases(budget);
        self.counters.last_run_unix_secs.store(now_secs(), Ordering::Release);
        self.running.store(false, Ordering::Release);
        report
    }

    /// Runs all three phases with no time limit; used on shutdown.
    pub fn perform_full_housekeeping(&self) -> HousekeepingReport {
        self.perform_time_budgeted_housekeeping(Duration::from_secs(u64::MAX / 2_000_000_000))
    }

    fn run_phases(&self, budget: Duration) -> HousekeepingReport {
        let start = Instant::now();
        let total_ns = budget.as_nanos().min(u128::from(u64::MAX)) as u64;
        let gc_budget = Duration::from_nanos(total_ns * 40 / 100);

        let (gc_status, files_deleted, bytes_reclaimed) = self.run_gc_phase(gc_budget);
        self.counters.total_gc.fetch_add(1, Ordering::AcqRel);
        self.counters.total_bytes_reclaimed.fetch_add(bytes_reclaimed, Ordering::AcqRel);

        let elapsed = start.elapsed();
        let remaining_ns = total_ns.saturating_sub(elapsed.as_nanos().min(u128::from(u64::MAX)) as u64);
        let consolidation_budget = Duration::from_nanos(remaining_ns * 40 / 100);

        let (consolidation_status, groups) = self.run_consolidation_phase(consolidation_budget);
        self.counters
            .total_consolidations
            .fetch_add(groups, Ordering::AcqRel);

        let optimization_status = self.run_optimization_phase();

        HousekeepingReport {
            gc: gc_status,
            consolidation: consolidation_status,
            optimization: optimization_status,
            files_deleted,
            bytes_reclaimed,
            consolidation_groups: groups,
        }
    }

    fn run_gc_phase(&self, budget: Duration) -> (PhaseStatus, u64, u64) {
        if budget.is_zero() {
            return (PhaseStatus::Completed, 0, 0);
        }

        let start = Instant::now();
        let mut files_deleted = 0u64;
        let mut bytes_reclaimed = 0u64;

        for channel in &self.channels {
            let entries = match FS::read_dir(channel.dir()) {
                Ok(entries) => entries,
                Err(e) => return (PhaseStatus::Failed(e.to_string()), files_deleted, bytes_reclaimed),
            };

            for entry in entries {
                if start.elapsed() >= budget {
                    return (PhaseStatus::TimeBudgetExceeded, files_deleted, bytes_reclaimed);
                }
                if entry.is_dir() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str() else {
                    continue;
                };
                if !is_orphan(name) {
                    continue;
                }

                let size = FS::file_size(entry.path()).unwrap_or(0);
                match FS::remove_file(entry.path()) {
                    Ok(()) => {
                        files_deleted += 1;
                        bytes_reclaimed += size;
                    }
                    Err(e) => {
                        log::warn!("housekeeping: failed deleting orphan {}: {e}", entry.path().display());
                    }
                }
            }
        }

        (PhaseStatus::Completed, files_deleted, bytes_reclaimed)
    }

    fn run_consolidation_phase(&self, budget: Duration) -> (PhaseStatus, u64) {
        let start = Instant::now();
        let mut groups_merged = 0u64;

        for channel in &self.channels {
            let evaluator = channel.evaluator();
            let mut candidates: Vec<u64> = channel
                .file_numbers()
                .into_iter()
                .filter_map(|n| channel.file(n))
                .filter(|f| {
                    f.total_length() < CONSOLIDATION_THRESHOLD
                        || evaluator.needs_dissolving(f.total_length(), f.data_length())
                })
                .map(|f| f.file_number())
                .collect();
            candidates.sort_unstable();

            for batch in candidates.chunks(CONSOLIDATION_BATCH) {
                if batch.len() < 2 {
                    continue;
                }
                if start.elapsed() >= budget {
                    return (PhaseStatus::TimeBudgetExceeded, groups_merged);
                }

                let any_in_use = batch
                    .iter()
                    .filter_map(|n| channel.file(*n))
                    .any(|f| f.user_count() > 0);
                if any_in_use {
                    continue;
                }

                match channel.consolidate_group(batch) {
                    Ok(_) => groups_merged += 1,
                    Err(e) => log::warn!("housekeeping: consolidation group failed: {e}"),
                }
            }
        }

        (PhaseStatus::Completed, groups_merged)
    }

    /// Placeholder: defragmentation/index reorganization is not implemented.
    /// Records that the phase ran; see the design ledger for why this phase
    /// is a no-op rather than a real defragmenter.
    fn run_optimization_phase(&self) -> PhaseStatus {
        self.counters.total_optimizations.fetch_add(1, Ordering::AcqRel);
        PhaseStatus::Completed
    }

    /// Starts the periodic background timer. No-op if already running.
    pub fn start(self: &Arc<Self>, budget: HousekeepingBudget)
    where
        FS: Send + Sync,
    {
        let mut thread = self.thread.lock().expect("lock is poisoned");
        if thread.is_some() {
            return;
        }

        self.stop.store(false, Ordering::Release);
        let manager = self.clone();
        let stop = self.stop.clone();

        let handle = std::thread::Builder::new()
            .name("nebula-housekeeping".into())
            .spawn(move || loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(budget.interval);
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let _ = manager.perform_time_budgeted_housekeeping(Duration::from_nanos(budget.per_run_time_budget_ns));
            })
            .expect("failed to spawn housekeeping thread");

        *thread = Some(handle);
    }

    /// Stops the periodic timer and joins the background thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().expect("lock is poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor_table::DescriptorTable;
    use crate::file_evaluator::{FileEvaluator, WriteController};
    use crate::fs::StdFileSystem;

    fn channel(dir: &std::path::Path) -> Arc<FileManager<StdFileSystem>> {
        channel_with(dir, FileEvaluator::default())
    }

    fn channel_with(dir: &std::path::Path, evaluator: FileEvaluator) -> Arc<FileManager<StdFileSystem>> {
        Arc::new(
            FileManager::open(0, dir, Arc::new(DescriptorTable::new(16)), evaluator, WriteController::new(true))
                .unwrap(),
        )
    }

    #[test]
    fn gc_phase_deletes_orphan_files_and_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let fm = channel(dir.path());
        std::fs::write(dir.path().join("foo.tmp"), b"12345").unwrap();
        std::fs::write(dir.path().join("bar.bak"), b"123").unwrap();

        let manager = HousekeepingManager::new(vec![fm]);
        let report = manager.perform_time_budgeted_housekeeping(Duration::from_secs(1));

        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.bytes_reclaimed, 8);
        assert!(!dir.path().join("foo.tmp").exists());
        assert!(!dir.path().join("bar.bak").exists());
    }

    #[test]
    fn gc_is_idempotent_second_pass_reclaims_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fm = channel(dir.path());
        std::fs::write(dir.path().join("foo.tmp"), b"12345").unwrap();

        let manager = HousekeepingManager::new(vec![fm]);
        manager.perform_time_budgeted_housekeeping(Duration::from_secs(1));
        let second = manager.perform_time_budgeted_housekeeping(Duration::from_secs(1));

        assert_eq!(second.files_deleted, 0);
        assert_eq!(second.bytes_reclaimed, 0);
    }

    #[test]
    fn zero_budget_completes_immediately_with_no_work() {
        let dir = tempfile::tempdir().unwrap();
        let fm = channel(dir.path());
        std::fs::write(dir.path().join("foo.tmp"), b"x").unwrap();

        let manager = HousekeepingManager::new(vec![fm]);
        let report = manager.perform_time_budgeted_housekeeping(Duration::from_nanos(0));

        assert_eq!(report.gc, PhaseStatus::Completed);
        assert_eq!(report.files_deleted, 0);
    }

    #[test]
    fn consolidation_merges_five_small_files_into_one_group() {
        let dir = tempfile::tempdir().unwrap();
        let fm = channel_with(dir.path(), FileEvaluator::new(10, 10 * 1024 * 1024));

        for byte in [b'A', b'B', b'C', b'D', b'E'] {
            fm.store_chunks(&[&[byte; 10]]).unwrap();
            fm.commit_write().unwrap();
        }
        assert_eq!(fm.file_numbers().len(), 5);

        let manager = HousekeepingManager::new(vec![fm.clone()]);
        let report = manager.perform_time_budgeted_housekeeping(Duration::from_secs(1));

        assert_eq!(report.consolidation_groups, 1);
        assert_eq!(fm.file_numbers().len(), 1);
    }

    #[test]
    fn reentrant_tick_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let fm = channel(dir.path());
        let manager = Arc::new(HousekeepingManager::new(vec![fm]));

        manager.running.store(true, Ordering::Release);
        let report = manager.perform_time_budgeted_housekeeping(Duration::from_secs(1));
        assert_eq!(report.gc, PhaseStatus::InProgress);
        manager.running.store(false, Ordering::Release);
    }
}
