//! # engine
//!
//! why: isolate the consensus algorithm behind the few calls the driver actually makes
//! relations: implemented by raft.rs over raft-rs; driven exclusively by driver.rs
//! what: ConsensusEngine trait, Ready, Envelope, EngineStatus, Role, Boot

#[cfg(test)]
pub(crate) mod loopback;
pub mod raft;

use replica_core::{ConfigurationChange, HardState, LogEntry, Peer, Snapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::raft::RaftEngine;

/// An encoded consensus message addressed to one member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: u64,
    pub to: u64,
    /// Engine wire encoding, opaque to the transport
    pub payload: Vec<u8>,
}

/// One batch of engine output
///
/// the driver must persist `snapshot`, then `entries` and `hard_state`, before
/// sending `messages`, and must publish `committed` before calling advance
#[derive(Debug, Default)]
pub struct Ready {
    pub entries: Vec<LogEntry>,
    pub hard_state: Option<HardState>,
    /// A snapshot received from the leader
    pub snapshot: Option<Snapshot>,
    pub committed: Vec<LogEntry>,
    pub messages: Vec<Envelope>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
            && self.hard_state.is_none()
            && self.snapshot.is_none()
            && self.committed.is_empty()
            && self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub role: Role,
    pub term: u64,
    /// None while no leader is known
    pub leader: Option<u64>,
    pub commit: u64,
    pub last_index: u64,
}

/// Voting and non-voting members after a configuration change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Voters {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
}

/// Everything recovered from storage that the engine starts from
#[derive(Debug, Default)]
pub struct Boot {
    pub snapshot: Option<Snapshot>,
    pub hard_state: HardState,
    /// Entries after the snapshot, contiguous from snapshot index + 1
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// the input was refused; the node keeps running
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Fatal(String),
}

/// the consensus capability the driver needs
///
/// every call is synchronous and made from the driver task only
pub trait ConsensusEngine: Send {
    /// advance logical time by one tick
    fn tick(&mut self);

    fn propose(&mut self, data: Vec<u8>) -> Result<(), EngineError>;

    fn propose_conf_change(&mut self, change: &ConfigurationChange) -> Result<(), EngineError>;

    /// feed a message received from a peer
    fn step(&mut self, message: Envelope) -> Result<(), EngineError>;

    /// next batch of output, None when there is nothing to do
    ///
    /// repeated calls without advance return only output that was carried over
    fn ready(&mut self) -> Result<Option<Ready>, EngineError>;

    /// acknowledge that the last ready has been persisted and published
    fn advance(&mut self) -> Result<(), EngineError>;

    /// apply a committed config-change entry to the voter set
    fn apply_conf_change(&mut self, entry: &LogEntry) -> Result<Voters, EngineError>;

    /// a locally taken snapshot, served to members that fall behind the log
    fn set_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), EngineError>;

    /// forget in-memory entries at or below index
    fn compact(&mut self, index: u64) -> Result<(), EngineError>;

    fn status(&self) -> EngineStatus;

    /// committed entries that seed a brand-new cluster with its initial members
    fn bootstrap_entries(peers: &[Peer]) -> Result<Vec<LogEntry>, EngineError>
    where
        Self: Sized;
}
