//! # error
//!
//! why: name every way persisted state can fail to be written or read back
//! relations: returned by every LogStore and SnapshotStore operation
//! what: StorageError, StorageResult

use std::io;

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// storage failures; all of them are fatal to the node that hits them
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failure: {0}")]
    Io(#[from] io::Error),

    /// a complete persisted record that cannot be decoded or is out of sequence
    #[error("corrupt record in {file} at line {line}: {reason}")]
    Corrupt {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("non-contiguous append: expected index at most {expected}, found {found}")]
    NonContiguous { expected: u64, found: u64 },

    #[error("snapshot at index {attempted} precedes latest snapshot at index {latest}")]
    SnapshotRegression { latest: u64, attempted: u64 },
}

impl StorageError {
    pub(crate) fn corrupt(file: &std::path::Path, line: usize, reason: impl ToString) -> Self {
        Self::Corrupt {
            file: file.display().to_string(),
            line,
            reason: reason.to_string(),
        }
    }
}
