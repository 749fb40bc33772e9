//! # memory
//!
//! why: drive the node in tests without touching the filesystem
//! relations: implements LogStore and SnapshotStore with the same contracts as wal.rs and snap.rs
//! what: InMemoryLog, InMemorySnapshotStore (cloneable handles that outlive a node)

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use replica_core::{HardState, LogEntry, Snapshot};

use crate::{plan_append, AppendPlan, LogStore, Replay, SnapshotStore, StorageError, StorageResult};

#[derive(Debug, Default)]
struct MemLog {
    base: u64,
    entries: Vec<LogEntry>,
    hard_state: HardState,
}

/// in-memory log store for testing
///
/// clones share state, so a test can restart a node on the same log
#[derive(Debug, Clone, Default)]
pub struct InMemoryLog {
    inner: Arc<Mutex<MemLog>>,
}

impl InMemoryLog {
    /// create a new in-memory log
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemLog> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// every retained entry, for inspection
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.clone()
    }
}

impl MemLog {
    fn last(&self) -> u64 {
        self.entries.last().map_or(self.base, |e| e.index)
    }
}

impl LogStore for InMemoryLog {
    fn append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) -> StorageResult<()> {
        let mut log = self.lock();
        match plan_append(log.base, log.last(), entries)? {
            AppendPlan::Nothing => {}
            AppendPlan::Extend => log.entries.extend_from_slice(entries),
            AppendPlan::Truncate(from) => {
                log.entries.retain(|e| e.index < from);
                log.entries.extend_from_slice(entries);
            }
        }
        if let Some(hs) = hard_state {
            log.hard_state = *hs;
        }
        Ok(())
    }

    fn replay_since(&self, index: u64) -> StorageResult<Replay> {
        let entries: Vec<LogEntry> = self
            .lock()
            .entries
            .iter()
            .filter(|e| e.index >= index)
            .cloned()
            .collect();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn compact_through(&mut self, index: u64) -> StorageResult<()> {
        let mut log = self.lock();
        if index <= log.base {
            return Ok(());
        }
        let through = index.min(log.last());
        log.entries.retain(|e| e.index > through);
        log.base = through;
        Ok(())
    }

    fn reset_to(&mut self, index: u64) -> StorageResult<()> {
        let mut log = self.lock();
        log.entries.clear();
        log.base = index;
        Ok(())
    }

    fn hard_state(&self) -> HardState {
        self.lock().hard_state
    }

    fn first_index(&self) -> u64 {
        self.lock().base + 1
    }

    fn last_index(&self) -> u64 {
        self.lock().last()
    }
}

/// in-memory snapshot store for testing
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of snapshots saved so far
    pub fn saved(&self) -> usize {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&mut self, snapshot: &Snapshot) -> StorageResult<()> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latest) = snapshots.last() {
            if snapshot.index < latest.index {
                return Err(StorageError::SnapshotRegression {
                    latest: latest.index,
                    attempted: snapshot.index,
                });
            }
        }
        snapshots.push(snapshot.clone());
        Ok(())
    }

    fn load_latest(&self) -> StorageResult<Option<Snapshot>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned())
    }
}
