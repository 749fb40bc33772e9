//! # loopback
//!
//! why: drive the node deterministically in unit tests, with no elections and no timing
//! relations: test-only ConsensusEngine used by driver.rs and membership.rs tests
//! what: single-member engine that is always leader and commits whatever it persisted

use replica_core::{ChangeKind, ConfigurationChange, HardState, LogEntry, Peer, Snapshot};

use super::{Boot, ConsensusEngine, EngineError, EngineStatus, Envelope, Ready, Role, Voters};

pub(crate) struct LoopbackEngine {
    id: u64,
    term: u64,
    /// entries after `base`
    log: Vec<LogEntry>,
    base: u64,
    /// first index not yet handed out for persistence
    unstable: u64,
    commit: u64,
    /// last committed index handed out for publishing
    handed: u64,
    hard_state: HardState,
    /// (last persisted, last handed) of the ready in flight
    in_flight: Option<(u64, u64)>,
    voters: Vec<u64>,
    pub(crate) served_snapshot: Option<Snapshot>,
}

impl LoopbackEngine {
    pub(crate) fn new(id: u64, boot: &Boot) -> Self {
        let base = boot.snapshot.as_ref().map_or(0, |s| s.index);
        let voters = boot
            .snapshot
            .as_ref()
            .map_or_else(Vec::new, |s| s.config.voters.clone());
        let last = boot.entries.last().map_or(base, |e| e.index);
        Self {
            id,
            term: boot.hard_state.term.max(1),
            log: boot.entries.clone(),
            base,
            unstable: last + 1,
            commit: boot.hard_state.commit.max(base),
            handed: base,
            hard_state: boot.hard_state,
            in_flight: None,
            voters,
            served_snapshot: None,
        }
    }

    fn last_index(&self) -> u64 {
        self.log.last().map_or(self.base, |e| e.index)
    }

    fn push(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }
}

impl ConsensusEngine for LoopbackEngine {
    fn tick(&mut self) {}

    fn propose(&mut self, data: Vec<u8>) -> Result<(), EngineError> {
        let index = self.last_index() + 1;
        self.push(LogEntry::new(self.term, index, data));
        Ok(())
    }

    fn propose_conf_change(&mut self, change: &ConfigurationChange) -> Result<(), EngineError> {
        let context = change
            .encode()
            .map_err(|e| EngineError::Rejected(e.to_string()))?;
        let index = self.last_index() + 1;
        self.push(LogEntry::config_change(self.term, index, Vec::new(), context));
        Ok(())
    }

    fn step(&mut self, message: Envelope) -> Result<(), EngineError> {
        Err(EngineError::Rejected(format!(
            "loopback engine has no peers (message from {})",
            message.from
        )))
    }

    fn ready(&mut self) -> Result<Option<Ready>, EngineError> {
        if self.in_flight.is_some() {
            return Ok(None);
        }
        let entries: Vec<LogEntry> = self
            .log
            .iter()
            .filter(|e| e.index >= self.unstable)
            .cloned()
            .collect();
        let committed: Vec<LogEntry> = self
            .log
            .iter()
            .filter(|e| e.index > self.handed && e.index <= self.commit)
            .cloned()
            .collect();
        let hard_state = HardState::new(self.term, self.id, self.commit);
        let hs_changed = hard_state != self.hard_state;

        if entries.is_empty() && committed.is_empty() && !hs_changed {
            return Ok(None);
        }
        self.hard_state = hard_state;
        self.in_flight = Some((self.last_index(), self.commit.max(self.handed)));
        Ok(Some(Ready {
            entries,
            hard_state: hs_changed.then_some(hard_state),
            snapshot: None,
            committed,
            messages: Vec::new(),
        }))
    }

    fn advance(&mut self) -> Result<(), EngineError> {
        if let Some((persisted, handed)) = self.in_flight.take() {
            self.unstable = persisted + 1;
            self.handed = handed;
            // a lone member commits as soon as it persisted
            self.commit = persisted;
        }
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &LogEntry) -> Result<Voters, EngineError> {
        let change = ConfigurationChange::decode(&entry.context)
            .map_err(|e| EngineError::Fatal(e.to_string()))?;
        match change.kind {
            ChangeKind::AddMember | ChangeKind::UpdateMember => {
                if !self.voters.contains(&change.member_id) {
                    self.voters.push(change.member_id);
                }
            }
            ChangeKind::RemoveMember => self.voters.retain(|id| *id != change.member_id),
            ChangeKind::AddNonVotingMember => {}
        }
        Ok(Voters {
            voters: self.voters.clone(),
            learners: Vec::new(),
        })
    }

    fn set_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), EngineError> {
        self.served_snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn compact(&mut self, index: u64) -> Result<(), EngineError> {
        let through = index.min(self.last_index());
        if through > self.base {
            self.log.retain(|e| e.index > through);
            self.base = through;
        }
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            role: Role::Leader,
            term: self.term,
            leader: Some(self.id),
            commit: self.commit,
            last_index: self.last_index(),
        }
    }

    fn bootstrap_entries(peers: &[Peer]) -> Result<Vec<LogEntry>, EngineError> {
        peers
            .iter()
            .zip(1..)
            .map(|(peer, index)| {
                let context = ConfigurationChange::add_member(peer.id, &peer.address)
                    .encode()
                    .map_err(|e| EngineError::Fatal(e.to_string()))?;
                Ok(LogEntry::config_change(1, index, Vec::new(), context))
            })
            .collect()
    }
}
