//! # membership
//!
//! why: keep the member set and its addresses in step with committed configuration changes
//! relations: driven by driver.rs at publish time; the table is read by transport.rs
//! what: MembershipTable (shared id -> address map), MembershipManager

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use replica_core::{ChangeKind, ClusterConfig, ConfigurationChange, LogEntry, Peer};
use tracing::{debug, info};

use crate::engine::ConsensusEngine;
use crate::error::NodeResult;

/// Member id -> address, written only by the node that owns it
#[derive(Debug, Clone, Default)]
pub struct MembershipTable {
    inner: Arc<RwLock<BTreeMap<u64, String>>>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u64, String>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u64, String>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn address(&self, id: u64) -> Option<String> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.read().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }

    /// true if the table changed
    pub(crate) fn insert(&self, id: u64, address: &str) -> bool {
        self.write().insert(id, address.to_string()).as_deref() != Some(address)
    }

    /// true if the id was present
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.write().remove(&id).is_some()
    }

    pub(crate) fn replace(&self, members: BTreeMap<u64, String>) {
        *self.write() = members;
    }
}

/// Outcome of applying one committed configuration change
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChangeApplied {
    pub change: ConfigurationChange,
    /// the change removed this node from the cluster
    pub removed_self: bool,
}

pub(crate) struct MembershipManager {
    local_id: u64,
    table: MembershipTable,
    config: ClusterConfig,
}

impl MembershipManager {
    pub fn new(local_id: u64, table: MembershipTable) -> Self {
        Self {
            local_id,
            table,
            config: ClusterConfig::default(),
        }
    }

    /// make the configured peers reachable before any membership entry commits
    pub fn seed(&mut self, peers: &[Peer]) {
        for peer in peers {
            self.table.insert(peer.id, &peer.address);
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// replace all membership with the configuration captured in a snapshot
    pub fn restore(&mut self, config: &ClusterConfig) {
        self.config = config.clone();
        self.table.replace(config.members.clone());
        info!(
            node_id = self.local_id,
            voters = ?config.voters,
            learners = ?config.learners,
            "membership restored from snapshot"
        );
    }

    /// apply a committed config-change entry to the engine and the table
    ///
    /// applying a change that is already reflected is a no-op
    pub fn apply_committed<E: ConsensusEngine>(
        &mut self,
        engine: &mut E,
        entry: &LogEntry,
    ) -> NodeResult<ChangeApplied> {
        let change = ConfigurationChange::decode(&entry.context)?;
        let voters = engine.apply_conf_change(entry)?;
        self.config.voters = voters.voters;
        self.config.learners = voters.learners;

        let changed = match change.kind {
            ChangeKind::AddMember | ChangeKind::AddNonVotingMember | ChangeKind::UpdateMember => {
                let recorded = self.config.members.insert(change.member_id, change.address.clone());
                let listed = self.table.insert(change.member_id, &change.address);
                listed || recorded.as_deref() != Some(change.address.as_str())
            }
            ChangeKind::RemoveMember => {
                let recorded = self.config.members.remove(&change.member_id).is_some();
                self.table.remove(change.member_id) || recorded
            }
        };

        if changed {
            info!(
                node_id = self.local_id,
                index = entry.index,
                kind = ?change.kind,
                member_id = change.member_id,
                address = %change.address,
                members = self.table.len(),
                "membership changed"
            );
        } else {
            debug!(
                node_id = self.local_id,
                index = entry.index,
                member_id = change.member_id,
                "membership change already applied"
            );
        }

        let removed_self = change.kind == ChangeKind::RemoveMember
            && change.member_id == self.local_id
            && !self.config.contains(self.local_id);
        Ok(ChangeApplied {
            change,
            removed_self,
        })
    }
}
