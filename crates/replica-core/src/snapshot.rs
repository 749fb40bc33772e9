//! # snapshot
//!
//! why: a point-in-time image of the application that replaces a log prefix
//! relations: saved by replica-storage snapshot stores, taken and installed by replica-node
//! what: Snapshot, ClusterConfig

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Cluster membership as of some log index
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Voting member ids
    pub voters: Vec<u64>,
    /// Non-voting member ids
    pub learners: Vec<u64>,
    /// Member id -> network address
    pub members: BTreeMap<u64, String>,
}

impl ClusterConfig {
    pub fn contains(&self, id: u64) -> bool {
        self.voters.contains(&id) || self.learners.contains(&id)
    }
}

/// All entries up to and including `index` are subsumed by `data`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub config: ClusterConfig,
    /// Opaque bytes produced by the application
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(index: u64, term: u64, config: ClusterConfig, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            config,
            data,
        }
    }
}
