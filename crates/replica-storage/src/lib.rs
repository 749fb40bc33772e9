//! # replica-storage
//!
//! why: provide durable persistence for the replicated log and application snapshots
//! relations: owned and mutated exclusively by replica-node's driver; types from replica-core
//! what: LogStore and SnapshotStore traits, file-backed and in-memory implementations

pub mod error;
mod fs_util;
pub mod memory;
pub mod snap;
pub mod wal;

use replica_core::{HardState, LogEntry, Snapshot};

pub use error::{StorageError, StorageResult};
pub use memory::{InMemoryLog, InMemorySnapshotStore};
pub use snap::FileSnapshotStore;
pub use wal::FileLog;

/// lazy, finite sequence of replayed entries; call replay_since again to restart it
pub type Replay = Box<dyn Iterator<Item = StorageResult<LogEntry>> + Send>;

/// trait for durable storage of the consensus log
///
/// this abstraction allows the same driver to work with:
/// - an append-only file (native)
/// - in-memory (testing)
///
/// invariant: stored indices are contiguous and strictly increasing
pub trait LogStore: Send {
    /// persist entries and hard state together: both or neither
    ///
    /// an append starting at or below the last stored index replaces the
    /// conflicting suffix
    fn append(&mut self, entries: &[LogEntry], hard_state: Option<&HardState>) -> StorageResult<()>;

    /// entries from `index` (inclusive) to the end
    fn replay_since(&self, index: u64) -> StorageResult<Replay>;

    /// discard entries at or below index
    fn compact_through(&mut self, index: u64) -> StorageResult<()>;

    /// discard every entry; the next append must start at index + 1
    fn reset_to(&mut self, index: u64) -> StorageResult<()>;

    /// latest persisted hard state (default for a fresh log)
    fn hard_state(&self) -> HardState;

    /// first retained index; last_index() + 1 when empty
    fn first_index(&self) -> u64;

    /// last stored index, or the compaction point when empty
    fn last_index(&self) -> u64;
}

/// trait for durable storage of application snapshots keyed by (index, term)
///
/// invariant: never holds a snapshot whose index precedes the previous one
pub trait SnapshotStore: Send {
    fn save(&mut self, snapshot: &Snapshot) -> StorageResult<()>;

    /// the most recent snapshot, None if the node never snapshotted
    fn load_latest(&self) -> StorageResult<Option<Snapshot>>;
}

/// what an append means for a log holding (base, last]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AppendPlan {
    Nothing,
    /// entries extend the log at last + 1
    Extend,
    /// entries overwrite the suffix starting at this index
    Truncate(u64),
}

pub(crate) fn plan_append(base: u64, last: u64, entries: &[LogEntry]) -> StorageResult<AppendPlan> {
    let Some(first) = entries.first() else {
        return Ok(AppendPlan::Nothing);
    };

    // entries within one append must themselves be contiguous
    for pair in entries.windows(2) {
        if pair[1].index != pair[0].index + 1 {
            return Err(StorageError::NonContiguous {
                expected: pair[0].index + 1,
                found: pair[1].index,
            });
        }
    }

    if first.index <= base || first.index > last + 1 {
        return Err(StorageError::NonContiguous {
            expected: last + 1,
            found: first.index,
        });
    }

    if first.index == last + 1 {
        Ok(AppendPlan::Extend)
    } else {
        Ok(AppendPlan::Truncate(first.index))
    }
}
