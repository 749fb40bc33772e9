//! # config
//!
//! why: every tunable of a node in one serde-friendly struct, passed explicitly at start
//! relations: read by driver.rs (intakes, snapshot cadence, drain) and engine/raft.rs (timing)
//! what: NodeConfig with defaults and validation

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use replica_core::Peer;
use serde::{Deserialize, Serialize};

/// Configuration for one replica node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Member id of this node (non-zero)
    pub id: u64,
    /// Initial cluster members, including this node unless joining
    pub peers: Vec<Peer>,
    /// Start empty and wait to be added by a committed membership change
    pub join: bool,
    /// Root of the `wal/` and `snap/` directories
    pub data_dir: PathBuf,
    /// Applied entries between two snapshots
    pub snapshot_count: u64,
    /// Entries kept behind a snapshot for slow followers
    pub catch_up_entries: u64,
    pub tick_interval_ms: u64,
    /// Ticks without a heartbeat before a follower campaigns
    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    pub proposal_queue: usize,
    pub conf_change_queue: usize,
    pub mailbox_queue: usize,
    /// Upper bound on delivering in-flight commits after the proposal intake closes
    pub drain_timeout_ms: u64,
    /// Snapshot files kept on disk
    pub max_snapshots: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            peers: Vec::new(),
            join: false,
            data_dir: PathBuf::from("./replica-data"),
            snapshot_count: 10_000,
            catch_up_entries: 5_000,
            tick_interval_ms: 100,
            election_tick: 10,
            heartbeat_tick: 1,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            proposal_queue: 1,
            conf_change_queue: 1,
            mailbox_queue: 1024,
            drain_timeout_ms: 5_000,
            max_snapshots: 5,
        }
    }
}

impl NodeConfig {
    /// config for a member of a new cluster rooted at `data_dir`
    pub fn new(id: u64, peers: Vec<Peer>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            peers,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn snap_dir(&self) -> PathBuf {
        self.data_dir.join("snap")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// address of this node among the configured peers
    pub fn address(&self) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.id == self.id)
            .map(|p| p.address.as_str())
    }

    /// Validate configuration, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id == 0 {
            errors.push("id must be non-zero".to_string());
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == 0 {
                errors.push("peer ids must be non-zero".to_string());
            }
            if !seen.insert(peer.id) {
                errors.push(format!("peer {} is listed twice", peer.id));
            }
        }
        if !self.join && !seen.contains(&self.id) {
            errors.push(format!(
                "peers must include this node ({}) unless joining",
                self.id
            ));
        }

        if self.snapshot_count == 0 {
            errors.push("snapshot_count must be at least 1".to_string());
        }
        if self.catch_up_entries == 0 {
            errors.push("catch_up_entries must be at least 1".to_string());
        }
        if self.catch_up_entries > self.snapshot_count {
            errors.push(format!(
                "catch_up_entries ({}) must not exceed snapshot_count ({})",
                self.catch_up_entries, self.snapshot_count
            ));
        }

        if self.tick_interval_ms == 0 {
            errors.push("tick_interval_ms must be at least 1".to_string());
        }
        if self.heartbeat_tick == 0 {
            errors.push("heartbeat_tick must be at least 1".to_string());
        }
        if self.election_tick <= self.heartbeat_tick {
            errors.push(format!(
                "election_tick ({}) must be greater than heartbeat_tick ({})",
                self.election_tick, self.heartbeat_tick
            ));
        }
        if self.max_inflight_msgs == 0 {
            errors.push("max_inflight_msgs must be at least 1".to_string());
        }

        for (name, size) in [
            ("proposal_queue", self.proposal_queue),
            ("conf_change_queue", self.conf_change_queue),
            ("mailbox_queue", self.mailbox_queue),
            ("max_snapshots", self.max_snapshots),
        ] {
            if size == 0 {
                errors.push(format!("{name} must be at least 1"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
