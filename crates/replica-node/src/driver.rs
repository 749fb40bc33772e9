//! # driver
//!
//! why: the one task that steps consensus, persists its output and feeds the application
//! relations: owns the engine (engine/), both stores (replica-storage), the membership manager
//! and the commit pipeline; talks to peers through transport.rs
//! what: Node::start, NodeHandle, NodeStatus, the event loop and its recovery, snapshot and
//! drain logic

use std::sync::Arc;
use std::time::Duration;

use replica_core::{ConfigurationChange, EntryKind, HardState, LogEntry, Snapshot};
use replica_storage::{FileLog, FileSnapshotStore, LogStore, SnapshotStore, StorageResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::engine::{Boot, ConsensusEngine, EngineError, Envelope, RaftEngine, Ready, Role};
use crate::error::{NodeError, NodeResult};
use crate::membership::{MembershipManager, MembershipTable};
use crate::pipeline::{
    AckQueue, Applied, BatchKind, CommitBatch, Commits, Committed, CompletionSignal,
};
use crate::state_machine::StateMachine;
use crate::transport::Transport;

/// Observable node state, refreshed after every loop iteration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: u64,
    pub role: Role,
    pub term: u64,
    pub leader: Option<u64>,
    pub commit: u64,
    /// Last index the application acknowledged
    pub applied: u64,
    pub snapshot_index: u64,
    pub last_index: u64,
}

/// Resolves with the node's terminal result
pub struct Done {
    rx: oneshot::Receiver<NodeResult<()>>,
}

impl Done {
    pub async fn wait(self) -> NodeResult<()> {
        self.rx.await.unwrap_or(Err(NodeError::Stopped))
    }
}

/// The channels of a running node
///
/// dropping `proposals` shuts the node down once in-flight commits are delivered
pub struct NodeHandle {
    pub id: u64,
    pub proposals: mpsc::Sender<Vec<u8>>,
    pub conf_changes: mpsc::Sender<ConfigurationChange>,
    /// Messages received from peers
    pub mailbox: mpsc::Sender<Envelope>,
    pub commits: Commits,
    pub status: watch::Receiver<NodeStatus>,
    pub done: Done,
}

/// Durable state and collaborators a node is assembled from
pub struct NodeParts {
    pub log: Box<dyn LogStore>,
    pub snapshots: Box<dyn SnapshotStore>,
    pub state_machine: Arc<dyn StateMachine>,
    pub transport: Arc<dyn Transport>,
    pub membership: MembershipTable,
}

pub struct Node;

impl Node {
    /// start a raft-backed node with on-disk storage under `config.data_dir`
    ///
    /// must be called from within a tokio runtime
    pub fn start(
        config: NodeConfig,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        membership: MembershipTable,
    ) -> NodeResult<NodeHandle> {
        config.validate().map_err(NodeError::Config)?;
        let parts = NodeParts {
            log: Box::new(FileLog::open(config.wal_dir())?),
            snapshots: Box::new(FileSnapshotStore::open(
                config.snap_dir(),
                config.max_snapshots,
            )?),
            state_machine,
            transport,
            membership,
        };
        Self::start_with(config, parts, RaftEngine::new)
    }

    /// start a node on explicit stores and engine
    pub fn start_with<E, F>(config: NodeConfig, parts: NodeParts, make_engine: F) -> NodeResult<NodeHandle>
    where
        E: ConsensusEngine + 'static,
        F: FnOnce(&NodeConfig, &Boot) -> Result<E, EngineError>,
    {
        config.validate().map_err(NodeError::Config)?;
        let NodeParts {
            mut log,
            snapshots,
            state_machine,
            transport,
            membership: table,
        } = parts;

        info!(
            node_id = config.id,
            address = config.address().unwrap_or_default(),
            join = config.join,
            "starting node"
        );
        let mut membership = MembershipManager::new(config.id, table);
        let snapshot = snapshots.load_latest()?;
        if let Some(snapshot) = &snapshot {
            state_machine
                .restore_snapshot(&snapshot.data)
                .map_err(NodeError::Restore)?;
            membership.restore(&snapshot.config);
            info!(
                node_id = config.id,
                index = snapshot.index,
                term = snapshot.term,
                "restored application from snapshot"
            );
            // a crash between saving an installed snapshot and resetting the log
            // leaves a log that no longer joins up with the snapshot
            if log.last_index() < snapshot.index || log.first_index() > snapshot.index + 1 {
                warn!(
                    node_id = config.id,
                    snapshot_index = snapshot.index,
                    first_index = log.first_index(),
                    last_index = log.last_index(),
                    "log does not continue the snapshot, resetting it"
                );
                log.reset_to(snapshot.index)?;
            }
        }
        let (snapshot_index, snapshot_term) = snapshot.as_ref().map_or((0, 0), |s| (s.index, s.term));

        let mut hard_state = log.hard_state();
        let mut entries = log
            .replay_since(snapshot_index + 1)?
            .collect::<StorageResult<Vec<LogEntry>>>()?;
        if let Some(first) = entries.first() {
            if first.index != snapshot_index + 1 {
                return Err(NodeError::OutOfOrder {
                    expected: snapshot_index + 1,
                    found: first.index,
                });
            }
        }

        let fresh = snapshot.is_none()
            && entries.is_empty()
            && hard_state.is_empty()
            && log.last_index() == 0;
        if fresh {
            // a restarted member learns its peers from the snapshot and replayed log instead
            membership.seed(&config.peers);
        }
        if fresh && !config.join {
            let mut peers = config.peers.clone();
            peers.sort_by_key(|p| p.id);
            entries = E::bootstrap_entries(&peers)?;
            hard_state = HardState::new(1, 0, entries.len() as u64);
            log.append(&entries, Some(&hard_state))?;
            info!(node_id = config.id, members = peers.len(), "bootstrapped new cluster");
        }

        let replay_target = hard_state.commit.max(snapshot_index);
        info!(
            node_id = config.id,
            snapshot_index,
            last_index = entries.last().map_or(snapshot_index, |e| e.index),
            commit = replay_target,
            "replaying log"
        );

        let boot = Boot {
            snapshot,
            hard_state,
            entries,
        };
        let engine = make_engine(&config, &boot)?;

        let (proposals_tx, proposals) = mpsc::channel(config.proposal_queue);
        let (conf_changes_tx, conf_changes) = mpsc::channel(config.conf_change_queue);
        let (mailbox_tx, mailbox) = mpsc::channel(config.mailbox_queue);
        let (commits_tx, commits_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(NodeStatus {
            id: config.id,
            ..Default::default()
        });
        let (done_tx, done_rx) = oneshot::channel();

        let id = config.id;
        let driver = Driver {
            id,
            config,
            engine,
            log,
            snapshots,
            transport,
            state_machine,
            membership,
            commits: commits_tx,
            acks: AckQueue::default(),
            status: status_tx,
            published: snapshot_index,
            published_term: snapshot_term,
            applied: snapshot_index,
            snapshot_index,
            replay_target: Some(replay_target),
            removed: false,
        };
        let inputs = Inputs {
            proposals,
            conf_changes,
            mailbox,
            held_proposal: None,
            held_change: None,
        };
        tokio::spawn(driver.run(inputs, done_tx));

        Ok(NodeHandle {
            id,
            proposals: proposals_tx,
            conf_changes: conf_changes_tx,
            mailbox: mailbox_tx,
            commits: Commits::new(commits_rx),
            status,
            done: Done { rx: done_rx },
        })
    }
}

struct Inputs {
    proposals: mpsc::Receiver<Vec<u8>>,
    conf_changes: mpsc::Receiver<ConfigurationChange>,
    mailbox: mpsc::Receiver<Envelope>,
    /// taken from an intake while no leader was known
    held_proposal: Option<Vec<u8>>,
    held_change: Option<ConfigurationChange>,
}

enum Event {
    Tick,
    Proposal(Option<Vec<u8>>),
    ConfChange(Option<ConfigurationChange>),
    Message(Option<Envelope>),
    Acked(Option<Applied>),
}

/// shutdown in progress: deliver what was proposed before the intake closed
struct Drain {
    target: u64,
    deadline: Instant,
    /// ticks left to let followers learn the final commit index
    linger: usize,
}

struct Driver<E> {
    id: u64,
    config: NodeConfig,
    engine: E,
    log: Box<dyn LogStore>,
    snapshots: Box<dyn SnapshotStore>,
    transport: Arc<dyn Transport>,
    state_machine: Arc<dyn StateMachine>,
    membership: MembershipManager,
    commits: mpsc::UnboundedSender<CommitBatch>,
    acks: AckQueue,
    status: watch::Sender<NodeStatus>,
    /// last index handed to the pipeline
    published: u64,
    published_term: u64,
    /// last index the application acknowledged
    applied: u64,
    snapshot_index: u64,
    /// commit index at startup; cleared once the replay marker went out
    replay_target: Option<u64>,
    removed: bool,
}

impl<E: ConsensusEngine> Driver<E> {
    async fn run(mut self, mut inputs: Inputs, done: oneshot::Sender<NodeResult<()>>) {
        let id = self.id;
        info!(node_id = id, "node started");
        let result = self.event_loop(&mut inputs).await;
        match &result {
            Ok(()) => info!(node_id = id, applied = self.applied, "node stopped"),
            Err(e) => error!(node_id = id, error = %e, "node stopped on fatal error"),
        }
        // closes the commit pipeline before the result is observable
        drop(self);
        drop(inputs);
        let _ = done.send(result);
    }

    async fn event_loop(&mut self, inputs: &mut Inputs) -> NodeResult<()> {
        // recovered entries are published before any new input is taken
        self.process_ready()?;
        self.publish_status();

        let mut ticker = time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut proposals_open = true;
        let mut conf_changes_open = true;
        let mut mailbox_open = true;
        let mut drain: Option<Drain> = None;

        loop {
            if self.removed {
                info!(node_id = self.id, "removed from the cluster, stopping");
                return Ok(());
            }

            let event = tokio::select! {
                _ = ticker.tick() => Event::Tick,
                proposal = inputs.proposals.recv(),
                    if proposals_open && inputs.held_proposal.is_none() => Event::Proposal(proposal),
                change = inputs.conf_changes.recv(),
                    if conf_changes_open && drain.is_none() && inputs.held_change.is_none() => {
                    Event::ConfChange(change)
                }
                message = inputs.mailbox.recv(), if mailbox_open => Event::Message(message),
                acked = self.acks.next(), if self.acks.is_waiting() => Event::Acked(acked),
            };

            let ticked = matches!(event, Event::Tick);
            match event {
                Event::Tick => self.engine.tick(),
                Event::Proposal(Some(data)) => inputs.held_proposal = Some(data),
                Event::Proposal(None) => {
                    proposals_open = false;
                    let target = self.engine.status().last_index;
                    info!(node_id = self.id, target, "proposal intake closed, draining");
                    drain = Some(Drain {
                        target,
                        deadline: Instant::now() + self.config.drain_timeout(),
                        linger: self.config.heartbeat_tick + 1,
                    });
                }
                Event::ConfChange(Some(change)) => inputs.held_change = Some(change),
                Event::ConfChange(None) => conf_changes_open = false,
                Event::Message(Some(message)) => {
                    let from = message.from;
                    if let Err(e) = self.engine.step(message) {
                        debug!(node_id = self.id, from, error = %e, "dropping inbound message");
                    }
                }
                Event::Message(None) => mailbox_open = false,
                Event::Acked(Some(applied)) => self.on_applied(applied)?,
                Event::Acked(None) => warn!(
                    node_id = self.id,
                    applied = self.applied,
                    "a commit batch was dropped without completion; snapshots are suspended"
                ),
            }

            self.forward_held(inputs, drain.as_mut());
            self.process_ready()?;
            self.publish_status();

            if let Some(d) = drain.as_mut() {
                if self.drained(d, inputs, ticked) {
                    return Ok(());
                }
            }
        }
    }

    /// propose whatever an intake handed over once a leader is known
    fn forward_held(&mut self, inputs: &mut Inputs, drain: Option<&mut Drain>) {
        if self.engine.status().leader.is_none() {
            return;
        }
        if let Some(data) = inputs.held_proposal.take() {
            if let Err(e) = self.engine.propose(data) {
                warn!(node_id = self.id, error = %e, "proposal dropped");
            }
        }
        if let Some(change) = inputs.held_change.take() {
            if let Err(e) = self.engine.propose_conf_change(&change) {
                warn!(
                    node_id = self.id,
                    member_id = change.member_id,
                    error = %e,
                    "configuration change dropped"
                );
            }
        }
        if let Some(drain) = drain {
            drain.target = drain.target.max(self.engine.status().last_index);
        }
    }

    fn drained(&self, drain: &mut Drain, inputs: &Inputs, ticked: bool) -> bool {
        if Instant::now() >= drain.deadline {
            warn!(
                node_id = self.id,
                target = drain.target,
                published = self.published,
                "drain timed out"
            );
            return true;
        }
        let status = self.engine.status();
        let settled = inputs.held_proposal.is_none()
            && status.commit >= drain.target
            && self.published >= drain.target;
        if !settled {
            return false;
        }
        if drain.linger == 0 {
            return true;
        }
        if ticked {
            drain.linger -= 1;
        }
        false
    }

    /// handle every engine output that is ready: persist, send, publish, advance
    fn process_ready(&mut self) -> NodeResult<()> {
        while let Some(ready) = self.engine.ready()? {
            let Ready {
                entries,
                hard_state,
                snapshot,
                committed,
                messages,
            } = ready;

            if let Some(snapshot) = snapshot {
                self.install_snapshot(snapshot)?;
            }
            if !entries.is_empty() || hard_state.is_some() {
                self.log.append(&entries, hard_state.as_ref())?;
            }
            if !messages.is_empty() {
                self.transport.send(messages);
            }
            self.publish(committed)?;
            self.engine.advance()?;
        }
        self.finish_replay();
        Ok(())
    }

    fn publish(&mut self, committed: Vec<LogEntry>) -> NodeResult<()> {
        let Some(first) = committed.first() else {
            return Ok(());
        };
        if first.index > self.published + 1 {
            return Err(NodeError::OutOfOrder {
                expected: self.published + 1,
                found: first.index,
            });
        }

        let published = self.published;
        let fresh: Vec<LogEntry> = committed
            .into_iter()
            .filter(|e| e.index > published)
            .collect();
        let (Some(first), Some(last)) = (fresh.first(), fresh.last()) else {
            return Ok(());
        };
        let (first_index, last_index, last_term) = (first.index, last.index, last.term);

        let mut items = Vec::with_capacity(fresh.len());
        for entry in fresh {
            match entry.kind {
                EntryKind::Normal if entry.payload.is_empty() => {}
                EntryKind::Normal => items.push(Committed::Command {
                    index: entry.index,
                    data: entry.payload,
                }),
                EntryKind::ConfigChange => {
                    let applied = self.membership.apply_committed(&mut self.engine, &entry)?;
                    self.removed |= applied.removed_self;
                    items.push(Committed::Membership {
                        index: entry.index,
                        change: applied.change,
                    });
                }
            }
        }

        self.published = last_index;
        self.published_term = last_term;
        self.send_batch(first_index, BatchKind::Entries(items));
        Ok(())
    }

    /// a snapshot from the leader replaces everything up to its index
    fn install_snapshot(&mut self, snapshot: Snapshot) -> NodeResult<()> {
        if snapshot.index <= self.published {
            debug!(node_id = self.id, index = snapshot.index, "ignoring stale snapshot");
            return Ok(());
        }
        self.snapshots.save(&snapshot)?;
        self.log.reset_to(snapshot.index)?;
        self.membership.restore(&snapshot.config);
        info!(
            node_id = self.id,
            index = snapshot.index,
            term = snapshot.term,
            "installed snapshot from leader"
        );

        self.published = snapshot.index;
        self.published_term = snapshot.term;
        self.snapshot_index = snapshot.index;
        let index = snapshot.index;
        self.send_batch(index, BatchKind::Snapshot(snapshot));
        Ok(())
    }

    /// emit the replay marker once everything committed before the restart is out
    fn finish_replay(&mut self) {
        let Some(target) = self.replay_target else {
            return;
        };
        if self.published < target {
            return;
        }
        self.replay_target = None;
        info!(node_id = self.id, index = self.published, "replay complete");
        self.send_batch(self.published, BatchKind::ReplayComplete);
    }

    /// hand a batch ending at `published` to the pipeline and track its ack
    fn send_batch(&mut self, first_index: u64, kind: BatchKind) {
        let (signal, rx) = CompletionSignal::new();
        self.acks.push(
            Applied {
                index: self.published,
                term: self.published_term,
                config: self.membership.config().clone(),
            },
            rx,
        );
        let batch = CommitBatch::new(first_index, self.published, kind, signal);
        if self.commits.send(batch).is_err() {
            debug!(node_id = self.id, "commit consumer is gone");
        }
    }

    fn on_applied(&mut self, applied: Applied) -> NodeResult<()> {
        if applied.index <= self.applied {
            return Ok(());
        }
        self.applied = applied.index;
        if self.applied.saturating_sub(self.snapshot_index) < self.config.snapshot_count {
            return Ok(());
        }
        self.take_snapshot(applied)
    }

    fn take_snapshot(&mut self, applied: Applied) -> NodeResult<()> {
        let data = match self.state_machine.take_snapshot() {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    node_id = self.id,
                    index = applied.index,
                    error = %e,
                    "snapshot failed, retrying on a later ack"
                );
                return Ok(());
            }
        };
        let snapshot = Snapshot::new(applied.index, applied.term, applied.config, data);
        self.snapshots.save(&snapshot)?;
        self.engine.set_snapshot(&snapshot)?;
        self.snapshot_index = snapshot.index;

        if snapshot.index > self.config.catch_up_entries {
            let through = snapshot.index - self.config.catch_up_entries;
            self.engine.compact(through)?;
            self.log.compact_through(through)?;
            info!(node_id = self.id, through, "compacted log");
        }
        Ok(())
    }

    fn publish_status(&self) {
        let engine = self.engine.status();
        self.status.send_replace(NodeStatus {
            id: self.id,
            role: engine.role,
            term: engine.term,
            leader: engine.leader,
            commit: engine.commit,
            applied: self.applied,
            snapshot_index: self.snapshot_index,
            last_index: engine.last_index,
        });
    }
}

/// wait until the node reports a known leader, or give up after `timeout`
pub async fn wait_for_leader(
    status: &mut watch::Receiver<NodeStatus>,
    timeout: Duration,
) -> Option<u64> {
    let deadline = Instant::now() + timeout;
    loop {
        let leader = status.borrow().leader;
        if leader.is_some() {
            return leader;
        }
        match time::timeout_at(deadline, status.changed()).await {
            Ok(Ok(())) => {}
            _ => return None,
        }
    }
}
