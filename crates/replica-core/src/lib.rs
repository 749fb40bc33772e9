//! # replica-core
//!
//! why: one data model for everything that sits between consensus output and the application
//! relations: persisted by replica-storage, produced and consumed by replica-node
//! what: log entries, hard state, snapshots, cluster configuration, membership changes

pub mod log;
pub mod membership;
pub mod snapshot;

pub use log::{EntryKind, HardState, LogEntry};
pub use membership::{ChangeKind, CodecError, ConfigurationChange, Peer};
pub use snapshot::{ClusterConfig, Snapshot};
