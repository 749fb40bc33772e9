//! # raft
//!
//! why: run raft-rs as the consensus engine without leaking its types past this file
//! relations: implements engine::ConsensusEngine; boot state comes from driver.rs recovery
//! what: RaftEngine, EngineStorage (raft-rs Storage over MemStorage plus a snapshot cell),
//! conversions between raft-rs protobuf types and replica-core types

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use protobuf::Message as PbMessage;
use raft::eraftpb::{
    ConfChange, ConfChangeType, Entry, EntryType, HardState as RaftHardState, Message,
    Snapshot as RaftSnapshot,
};
use raft::storage::{GetEntriesContext, MemStorage, RaftState, Storage};
use raft::{Config, RawNode, StateRole, StorageError as RaftStorageError, INVALID_ID};
use replica_core::{
    ChangeKind, ClusterConfig, ConfigurationChange, EntryKind, HardState, LogEntry, Peer, Snapshot,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Boot, ConsensusEngine, EngineError, EngineStatus, Envelope, Ready, Role, Voters};
use crate::config::NodeConfig;

/// raft-rs Storage: entries and hard state live in MemStorage, mirrored from the
/// durable log by the driver; the snapshot cell holds the latest snapshot with its data
#[derive(Clone, Default)]
pub struct EngineStorage {
    log: MemStorage,
    snapshot: Arc<RwLock<RaftSnapshot>>,
}

impl EngineStorage {
    fn set_snapshot(&self, snapshot: RaftSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

impl Storage for EngineStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.log.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.log.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.log.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.log.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.log.last_index()
    }

    fn snapshot(&self, _request_index: u64, _to: u64) -> raft::Result<RaftSnapshot> {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        if snapshot.get_metadata().index == 0 {
            return Err(raft::Error::Store(
                RaftStorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snapshot.clone())
    }
}

/// raft snapshot data: the application image plus the member addresses
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    members: BTreeMap<u64, String>,
    data: Vec<u8>,
}

/// raft-rs RawNode behind the ConsensusEngine seam
pub struct RaftEngine {
    raw: RawNode<EngineStorage>,
    storage: EngineStorage,
    /// ready handed out and not yet advanced
    in_flight: Option<raft::Ready>,
    /// output produced by the last advance, returned by the next ready
    carry: Ready,
    learners: Vec<u64>,
}

impl RaftEngine {
    pub fn new(config: &NodeConfig, boot: &Boot) -> Result<Self, EngineError> {
        let storage = EngineStorage::default();
        let mut applied = 0;
        let mut learners = Vec::new();
        {
            let mut core = storage.log.wl();
            if let Some(snapshot) = &boot.snapshot {
                let snap = to_raft_snapshot(snapshot)?;
                core.apply_snapshot(snap.clone()).map_err(fatal)?;
                storage.set_snapshot(snap);
                applied = snapshot.index;
                learners = snapshot.config.learners.clone();
            }
            let entries: Vec<Entry> = boot.entries.iter().map(to_raft_entry).collect();
            core.append(&entries).map_err(fatal)?;

            let last = boot.entries.last().map_or(applied, |e| e.index);
            let mut hs = to_raft_hard_state(&boot.hard_state);
            hs.commit = hs.commit.clamp(applied, last.max(applied));
            core.set_hardstate(hs);
        }

        let cfg = Config {
            id: config.id,
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            applied,
            max_size_per_msg: config.max_size_per_msg,
            max_inflight_msgs: config.max_inflight_msgs,
            pre_vote: true,
            ..Default::default()
        };
        cfg.validate().map_err(fatal)?;

        // raft-rs logs through slog; the driver reports outcomes via tracing
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let raw = RawNode::new(&cfg, storage.clone(), &logger).map_err(fatal)?;

        Ok(Self {
            raw,
            storage,
            in_flight: None,
            carry: Ready::default(),
            learners,
        })
    }
}

impl ConsensusEngine for RaftEngine {
    fn tick(&mut self) {
        self.raw.tick();
    }

    fn propose(&mut self, data: Vec<u8>) -> Result<(), EngineError> {
        self.raw.propose(Vec::new(), data).map_err(rejected)
    }

    fn propose_conf_change(&mut self, change: &ConfigurationChange) -> Result<(), EngineError> {
        let change_type = match change.kind {
            ChangeKind::AddMember => ConfChangeType::AddNode,
            ChangeKind::RemoveMember => ConfChangeType::RemoveNode,
            ChangeKind::AddNonVotingMember => ConfChangeType::AddLearnerNode,
            // an address update keeps the member's current voting status
            ChangeKind::UpdateMember if self.learners.contains(&change.member_id) => {
                ConfChangeType::AddLearnerNode
            }
            ChangeKind::UpdateMember => ConfChangeType::AddNode,
        };
        let context = change.encode().map_err(rejected)?;
        let cc = conf_change(change_type, change.member_id, context.clone());
        self.raw.propose_conf_change(context, cc).map_err(rejected)
    }

    fn step(&mut self, message: Envelope) -> Result<(), EngineError> {
        let msg = Message::parse_from_bytes(&message.payload).map_err(rejected)?;
        self.raw.step(msg).map_err(rejected)
    }

    fn ready(&mut self) -> Result<Option<Ready>, EngineError> {
        let mut out = std::mem::take(&mut self.carry);
        let fresh = self.in_flight.is_none() && self.raw.has_ready();

        if fresh {
            let mut rd = self.raw.ready();
            if rd.snapshot().get_metadata().index != 0 {
                out.snapshot = Some(from_raft_snapshot(rd.snapshot())?);
            }
            out.entries = rd.entries().iter().map(from_raft_entry).collect();
            if let Some(hs) = rd.hs() {
                out.hard_state = Some(from_raft_hard_state(hs));
            }
            out.messages.extend(encode_messages(rd.take_messages()));
            out.messages
                .extend(encode_messages(rd.take_persisted_messages()));
            out.committed.extend(
                rd.take_committed_entries()
                    .iter()
                    .map(from_raft_entry),
            );
            self.in_flight = Some(rd);
        }

        // a fresh ready must be advanced even when it carries nothing for the driver
        Ok((fresh || !out.is_empty()).then_some(out))
    }

    fn advance(&mut self) -> Result<(), EngineError> {
        let Some(rd) = self.in_flight.take() else {
            self.raw.advance_apply();
            return Ok(());
        };

        {
            let mut core = self.storage.log.wl();
            if rd.snapshot().get_metadata().index != 0 {
                core.apply_snapshot(rd.snapshot().clone()).map_err(fatal)?;
                self.storage.set_snapshot(rd.snapshot().clone());
            }
            core.append(rd.entries()).map_err(fatal)?;
            if let Some(hs) = rd.hs() {
                core.set_hardstate(hs.clone());
            }
        }

        let mut light = self.raw.advance(rd);
        if let Some(commit) = light.commit_index() {
            let mut core = self.storage.log.wl();
            core.mut_hard_state().commit = commit;
            self.carry.hard_state = Some(from_raft_hard_state(core.hard_state()));
        }
        self.carry.messages = encode_messages(light.take_messages());
        self.carry.committed = light
            .take_committed_entries()
            .iter()
            .map(from_raft_entry)
            .collect();
        self.raw.advance_apply();
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &LogEntry) -> Result<Voters, EngineError> {
        let cc = ConfChange::parse_from_bytes(&entry.payload).map_err(fatal)?;
        let cs = self.raw.apply_conf_change(&cc).map_err(fatal)?;
        self.storage.log.wl().set_conf_state(cs.clone());
        self.learners = cs.learners.clone();
        Ok(Voters {
            voters: cs.voters,
            learners: cs.learners,
        })
    }

    fn set_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), EngineError> {
        self.storage.set_snapshot(to_raft_snapshot(snapshot)?);
        Ok(())
    }

    fn compact(&mut self, index: u64) -> Result<(), EngineError> {
        let last = self.storage.log.last_index().map_err(fatal)?;
        // MemStorage keeps the entry at compact_index
        self.storage
            .log
            .wl()
            .compact((index + 1).min(last + 1))
            .map_err(fatal)
    }

    fn status(&self) -> EngineStatus {
        let raft = &self.raw.raft;
        EngineStatus {
            role: match raft.state {
                StateRole::Follower => Role::Follower,
                StateRole::PreCandidate => Role::PreCandidate,
                StateRole::Candidate => Role::Candidate,
                StateRole::Leader => Role::Leader,
            },
            term: raft.term,
            leader: (raft.leader_id != INVALID_ID).then_some(raft.leader_id),
            commit: raft.raft_log.committed,
            last_index: raft.raft_log.last_index(),
        }
    }

    fn bootstrap_entries(peers: &[Peer]) -> Result<Vec<LogEntry>, EngineError> {
        peers
            .iter()
            .zip(1..)
            .map(|(peer, index)| {
                let change = ConfigurationChange::add_member(peer.id, &peer.address);
                let context = change.encode().map_err(fatal)?;
                let cc = conf_change(ConfChangeType::AddNode, peer.id, context.clone());
                let payload = cc.write_to_bytes().map_err(fatal)?;
                Ok(LogEntry::config_change(1, index, payload, context))
            })
            .collect()
    }
}

fn fatal(e: impl ToString) -> EngineError {
    EngineError::Fatal(e.to_string())
}

fn rejected(e: impl ToString) -> EngineError {
    EngineError::Rejected(e.to_string())
}

fn conf_change(change_type: ConfChangeType, member_id: u64, context: Vec<u8>) -> ConfChange {
    let mut cc = ConfChange::default();
    cc.set_change_type(change_type);
    cc.node_id = member_id;
    cc.context = context.into();
    cc
}

fn encode_messages(messages: Vec<Message>) -> Vec<Envelope> {
    messages
        .into_iter()
        .filter_map(|msg| match msg.write_to_bytes() {
            Ok(payload) => Some(Envelope {
                from: msg.from,
                to: msg.to,
                payload,
            }),
            Err(e) => {
                warn!(to = msg.to, error = %e, "failed to encode outbound message");
                None
            }
        })
        .collect()
}

fn to_raft_entry(entry: &LogEntry) -> Entry {
    let mut e = Entry::default();
    e.term = entry.term;
    e.index = entry.index;
    e.set_entry_type(match entry.kind {
        EntryKind::Normal => EntryType::EntryNormal,
        EntryKind::ConfigChange => EntryType::EntryConfChange,
    });
    e.data = entry.payload.clone().into();
    e.context = entry.context.clone().into();
    e
}

fn from_raft_entry(e: &Entry) -> LogEntry {
    let kind = match e.get_entry_type() {
        EntryType::EntryNormal => EntryKind::Normal,
        EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => EntryKind::ConfigChange,
    };
    LogEntry {
        term: e.term,
        index: e.index,
        kind,
        payload: e.data.to_vec(),
        context: e.context.to_vec(),
    }
}

fn to_raft_hard_state(hs: &HardState) -> RaftHardState {
    let mut out = RaftHardState::default();
    out.term = hs.term;
    out.vote = hs.vote;
    out.commit = hs.commit;
    out
}

fn from_raft_hard_state(hs: &RaftHardState) -> HardState {
    HardState::new(hs.term, hs.vote, hs.commit)
}

fn to_raft_snapshot(snapshot: &Snapshot) -> Result<RaftSnapshot, EngineError> {
    let payload = SnapshotPayload {
        members: snapshot.config.members.clone(),
        data: snapshot.data.clone(),
    };
    let mut snap = RaftSnapshot::default();
    snap.data = serde_json::to_vec(&payload).map_err(fatal)?.into();
    let meta = snap.mut_metadata();
    meta.index = snapshot.index;
    meta.term = snapshot.term;
    let cs = meta.mut_conf_state();
    cs.voters = snapshot.config.voters.clone();
    cs.learners = snapshot.config.learners.clone();
    Ok(snap)
}

fn from_raft_snapshot(snap: &RaftSnapshot) -> Result<Snapshot, EngineError> {
    let payload: SnapshotPayload = serde_json::from_slice(&snap.data).map_err(fatal)?;
    let meta = snap.get_metadata();
    let config = ClusterConfig {
        voters: meta.get_conf_state().voters.clone(),
        learners: meta.get_conf_state().learners.clone(),
        members: payload.members,
    };
    Ok(Snapshot::new(meta.index, meta.term, config, payload.data))
}
