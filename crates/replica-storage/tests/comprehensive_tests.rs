//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests replica-storage crate
//! what: persistence, crash recovery, compaction, snapshot ordering, edge cases

use replica_core::{ClusterConfig, HardState, LogEntry, Snapshot};
use replica_storage::{
    FileLog, FileSnapshotStore, InMemoryLog, InMemorySnapshotStore, LogStore, SnapshotStore,
    StorageError,
};
use tempfile::tempdir;

fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
    range
        .map(|i| LogEntry::new(term, i, format!("cmd{i}").into_bytes()))
        .collect()
}

fn replay(log: &dyn LogStore, from: u64) -> Vec<LogEntry> {
    log.replay_since(from)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn indices(entries: &[LogEntry]) -> Vec<u64> {
    entries.iter().map(|e| e.index).collect()
}

// =============================================================================
// SECTION 1: IN-MEMORY LOG TESTS
// =============================================================================

mod in_memory_log {
    use super::*;

    #[test]
    fn new_log_is_empty() {
        let log = InMemoryLog::new();

        assert!(replay(&log, 0).is_empty());
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert!(log.hard_state().is_empty());
    }

    #[test]
    fn append_in_batches() {
        let mut log = InMemoryLog::new();

        log.append(&entries(1..=1, 1), None).unwrap();
        log.append(&entries(2..=2, 1), None).unwrap();
        log.append(&entries(3..=3, 1), None).unwrap();

        assert_eq!(indices(&replay(&log, 0)), vec![1, 2, 3]);
    }

    #[test]
    fn hard_state_only_append() {
        let mut log = InMemoryLog::new();

        log.append(&[], Some(&HardState::new(4, 2, 0))).unwrap();

        assert_eq!(log.hard_state(), HardState::new(4, 2, 0));
        assert_eq!(log.last_index(), 0);
    }

    #[test]
    fn gap_is_rejected_and_nothing_is_written() {
        let mut log = InMemoryLog::new();
        log.append(&entries(1..=2, 1), None).unwrap();

        let err = log
            .append(&entries(4..=4, 1), Some(&HardState::new(9, 0, 0)))
            .unwrap_err();

        assert!(matches!(err, StorageError::NonContiguous { .. }));
        assert_eq!(log.last_index(), 2);
        assert!(log.hard_state().is_empty());
    }

    #[test]
    fn compact_then_replay_from_start() {
        let mut log = InMemoryLog::new();
        log.append(&entries(1..=8, 1), None).unwrap();

        log.compact_through(5).unwrap();

        assert_eq!(indices(&replay(&log, 0)), vec![6, 7, 8]);
        assert_eq!(log.first_index(), 6);
    }

    #[test]
    fn reset_discards_everything() {
        let mut log = InMemoryLog::new();
        log.append(&entries(1..=3, 1), None).unwrap();

        log.reset_to(10).unwrap();
        log.append(&entries(11..=11, 2), None).unwrap();

        assert_eq!(indices(&replay(&log, 0)), vec![11]);
    }
}

// =============================================================================
// SECTION 2: FILE LOG TESTS
// =============================================================================

mod file_log_basic {
    use super::*;

    #[test]
    fn open_creates_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        FileLog::open(&path).unwrap();

        assert!(path.exists());
    }

    #[test]
    fn append_and_replay_since_index() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();

        log.append(&entries(1..=5, 1), Some(&HardState::new(1, 1, 3)))
            .unwrap();

        assert_eq!(indices(&replay(&log, 3)), vec![3, 4, 5]);
        assert_eq!(log.hard_state().commit, 3);
    }

    #[test]
    fn replay_is_restartable() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();
        log.append(&entries(1..=3, 1), None).unwrap();

        let first: Vec<_> = replay(&log, 1);
        let second: Vec<_> = replay(&log, 1);

        assert_eq!(first, second);
    }

    #[test]
    fn replay_is_lazy() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();
        log.append(&entries(1..=100, 1), None).unwrap();

        let head: Vec<u64> = log
            .replay_since(1)
            .unwrap()
            .take(2)
            .map(|e| e.unwrap().index)
            .collect();

        assert_eq!(head, vec![1, 2]);
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();
        log.append(&entries(1..=5, 1), None).unwrap();

        log.append(&entries(3..=4, 2), Some(&HardState::new(2, 2, 2)))
            .unwrap();

        let all = replay(&log, 0);
        assert_eq!(indices(&all), vec![1, 2, 3, 4]);
        assert_eq!(all[2].term, 2);
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.hard_state().term, 2);
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn durability_round_trip() {
        let dir = tempdir().unwrap();
        let mut written = Vec::new();

        // first "session"
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            for batch in [entries(1..=3, 1), entries(4..=4, 2), entries(5..=9, 2)] {
                log.append(&batch, Some(&HardState::new(2, 1, batch[0].index)))
                    .unwrap();
                written.extend(batch);
            }
        }

        // "restart" - new log instance
        {
            let log = FileLog::open(dir.path()).unwrap();
            assert_eq!(replay(&log, 0), written);
            assert_eq!(log.hard_state(), HardState::new(2, 1, 5));
            assert_eq!(log.last_index(), 9);
        }
    }

    #[test]
    fn truncation_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(&entries(1..=4, 1), None).unwrap();
            log.append(&entries(2..=2, 3), None).unwrap();
            log.append(&entries(3..=3, 3), None).unwrap();
        }

        let log = FileLog::open(dir.path()).unwrap();
        let all = replay(&log, 0);
        assert_eq!(indices(&all), vec![1, 2, 3]);
        assert!(all[1..].iter().all(|e| e.term == 3));
    }

    #[test]
    fn compaction_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(&entries(1..=10, 1), Some(&HardState::new(1, 1, 10)))
                .unwrap();
            log.compact_through(6).unwrap();
            log.append(&entries(11..=12, 1), None).unwrap();
        }

        let log = FileLog::open(dir.path()).unwrap();
        assert_eq!(indices(&replay(&log, 0)), vec![7, 8, 9, 10, 11, 12]);
        assert_eq!(log.first_index(), 7);
        assert_eq!(log.hard_state().commit, 10);
    }

    #[test]
    fn reset_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            log.append(&entries(1..=3, 1), Some(&HardState::new(1, 0, 3)))
                .unwrap();
            log.reset_to(20).unwrap();
        }

        let mut log = FileLog::open(dir.path()).unwrap();
        assert_eq!(log.last_index(), 20);
        assert!(replay(&log, 0).is_empty());
        log.append(&entries(21..=21, 4), None).unwrap();
        assert_eq!(indices(&replay(&log, 0)), vec![21]);
    }

    #[test]
    fn compact_beyond_end_empties_log() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();
        log.append(&entries(1..=3, 1), None).unwrap();

        log.compact_through(50).unwrap();

        assert!(replay(&log, 0).is_empty());
        assert_eq!(log.last_index(), 3);
        log.append(&entries(4..=4, 1), None).unwrap();
    }

    #[test]
    fn compact_below_base_is_noop() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(dir.path()).unwrap();
        log.append(&entries(1..=6, 1), None).unwrap();
        log.compact_through(4).unwrap();

        log.compact_through(2).unwrap();

        assert_eq!(log.first_index(), 5);
    }
}

// =============================================================================
// SECTION 4: SNAPSHOT STORE TESTS
// =============================================================================

mod snapshots {
    use super::*;

    fn snapshot(index: u64, term: u64, data: &[u8]) -> Snapshot {
        let mut config = ClusterConfig {
            voters: vec![1, 2, 3],
            ..Default::default()
        };
        config.members.insert(1, "mem://1".into());
        Snapshot::new(index, term, config, data.to_vec())
    }

    #[test]
    fn file_store_loads_latest_after_restart() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileSnapshotStore::open(dir.path(), 5).unwrap();
            store.save(&snapshot(4, 1, b"first")).unwrap();
            store.save(&snapshot(9, 2, b"second")).unwrap();
        }

        let store = FileSnapshotStore::open(dir.path(), 5).unwrap();
        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest, snapshot(9, 2, b"second"));
    }

    #[test]
    fn file_store_refuses_older_snapshot() {
        let dir = tempdir().unwrap();
        let mut store = FileSnapshotStore::open(dir.path(), 5).unwrap();
        store.save(&snapshot(9, 2, b"new")).unwrap();

        let err = store.save(&snapshot(4, 1, b"old")).unwrap_err();

        assert!(matches!(
            err,
            StorageError::SnapshotRegression {
                latest: 9,
                attempted: 4
            }
        ));
    }

    #[test]
    fn regression_check_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileSnapshotStore::open(dir.path(), 5).unwrap();
            store.save(&snapshot(9, 2, b"new")).unwrap();
        }

        let mut store = FileSnapshotStore::open(dir.path(), 5).unwrap();
        assert!(store.save(&snapshot(8, 2, b"old")).is_err());
    }

    #[test]
    fn corrupt_snapshot_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileSnapshotStore::open(dir.path(), 5).unwrap();
            store.save(&snapshot(4, 1, b"data")).unwrap();
        }
        let name = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(&name, b"{ truncated").unwrap();

        let store = FileSnapshotStore::open(dir.path(), 5).unwrap();
        assert!(matches!(
            store.load_latest(),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn in_memory_store_counts_saves() {
        let mut store = InMemorySnapshotStore::new();
        store.save(&snapshot(4, 1, b"a")).unwrap();
        store.save(&snapshot(4, 1, b"a")).unwrap();

        assert_eq!(store.saved(), 2);
    }
}
