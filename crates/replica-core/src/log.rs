//! # log
//!
//! why: describe the entries the consensus engine replicates and the state it must never forget
//! relations: appended by replica-storage's log stores, delivered by replica-node's commit pipeline
//! what: LogEntry, EntryKind, HardState

use serde::{Deserialize, Serialize};

/// What a log entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// An opaque application command (possibly empty, e.g. a leader's no-op)
    #[default]
    Normal,
    /// A membership change; `context` holds the encoded ConfigurationChange
    ConfigChange,
}

/// A single entry in the replicated log
///
/// entries are immutable once appended and totally ordered by index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    #[serde(default)]
    pub kind: EntryKind,
    /// Engine-level payload: the application command for normal entries
    pub payload: Vec<u8>,
    /// Engine-level context bytes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<u8>,
}

impl LogEntry {
    /// Create a new normal entry
    pub fn new(term: u64, index: u64, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Normal,
            payload,
            context: Vec::new(),
        }
    }

    /// Create a configuration-change entry
    pub fn config_change(term: u64, index: u64, payload: Vec<u8>, context: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::ConfigChange,
            payload,
            context,
        }
    }

    pub fn is_config_change(&self) -> bool {
        self.kind == EntryKind::ConfigChange
    }
}

/// The minimal durable consensus state, persisted in the same write as new entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    /// Current term
    pub term: u64,
    /// Candidate voted for in the current term (0 = none)
    pub vote: u64,
    /// Highest index known to be committed
    pub commit: u64,
}

impl HardState {
    pub fn new(term: u64, vote: u64, commit: u64) -> Self {
        Self { term, vote, commit }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
