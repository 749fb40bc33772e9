//! # membership
//!
//! why: describe requested changes to the cluster's member set
//! relations: proposed through replica-node's configuration-change intake, carried in
//! config-change LogEntry context bytes, applied once committed
//! what: Peer, ChangeKind, ConfigurationChange and its context encoding

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A cluster member and the address its peers reach it at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub address: String,
}

impl Peer {
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Add a voting member
    AddMember,
    /// Remove a voting or non-voting member
    RemoveMember,
    /// Change the address of an existing member
    UpdateMember,
    /// Add a member that replicates but does not vote
    AddNonVotingMember,
}

/// A membership change request
///
/// it only takes effect once it is committed, never when merely proposed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationChange {
    pub kind: ChangeKind,
    pub member_id: u64,
    /// Empty for removals
    #[serde(default)]
    pub address: String,
}

/// Raised when a config-change entry's context cannot be encoded or decoded
#[derive(Debug, Error)]
#[error("malformed configuration change: {0}")]
pub struct CodecError(#[from] serde_json::Error);

impl ConfigurationChange {
    pub fn add_member(member_id: u64, address: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::AddMember,
            member_id,
            address: address.into(),
        }
    }

    pub fn add_non_voting_member(member_id: u64, address: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::AddNonVotingMember,
            member_id,
            address: address.into(),
        }
    }

    pub fn update_member(member_id: u64, address: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::UpdateMember,
            member_id,
            address: address.into(),
        }
    }

    pub fn remove_member(member_id: u64) -> Self {
        Self {
            kind: ChangeKind::RemoveMember,
            member_id,
            address: String::new(),
        }
    }

    /// encode for the context bytes of a config-change entry
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
