//! # pipeline
//!
//! why: hand committed entries to the application in order without ever blocking consensus
//! relations: batches are produced by driver.rs; completion acks flow back to it and gate snapshots
//! what: CommitBatch, BatchKind, Committed, CompletionSignal, Commits, process_commits,
//! AckQueue (driver side)

use std::collections::VecDeque;
use std::sync::Arc;

use replica_core::{ClusterConfig, ConfigurationChange, Snapshot};
use tokio::sync::{mpsc, oneshot};

use crate::state_machine::{AppError, StateMachine};

/// One committed entry as the application sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Committed {
    Command { index: u64, data: Vec<u8> },
    /// already applied to the membership table when delivered
    Membership {
        index: u64,
        change: ConfigurationChange,
    },
}

impl Committed {
    pub fn index(&self) -> u64 {
        match self {
            Self::Command { index, .. } | Self::Membership { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchKind {
    /// Committed entries in log order; empty no-op entries are left out
    Entries(Vec<Committed>),
    /// Everything committed before the restart has now been delivered
    ReplayComplete,
    /// Replace application state with this snapshot
    Snapshot(Snapshot),
}

/// Fires once the application has durably applied a batch
///
/// dropping it without completing tells the node the consumer is gone
#[derive(Debug)]
pub struct CompletionSignal {
    tx: oneshot::Sender<()>,
}

impl CompletionSignal {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn complete(self) {
        // the node may already have stopped
        let _ = self.tx.send(());
    }
}

/// A unit of delivery to the application
#[derive(Debug)]
pub struct CommitBatch {
    pub kind: BatchKind,
    /// Log index range covered by this batch
    pub first_index: u64,
    pub last_index: u64,
    signal: CompletionSignal,
}

impl CommitBatch {
    pub(crate) fn new(
        first_index: u64,
        last_index: u64,
        kind: BatchKind,
        signal: CompletionSignal,
    ) -> Self {
        Self {
            kind,
            first_index,
            last_index,
            signal,
        }
    }

    /// application command payloads, in order
    pub fn commands(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let items: &[Committed] = match &self.kind {
            BatchKind::Entries(items) => items,
            _ => &[],
        };
        items.iter().filter_map(|item| match item {
            Committed::Command { data, .. } => Some(data.as_slice()),
            Committed::Membership { .. } => None,
        })
    }

    pub fn is_replay_complete(&self) -> bool {
        self.kind == BatchKind::ReplayComplete
    }

    /// mark the batch applied
    pub fn complete(self) {
        self.signal.complete();
    }
}

/// Receiving end of the commit pipeline
///
/// yields None once the node has stopped and everything published was received
#[derive(Debug)]
pub struct Commits {
    rx: mpsc::UnboundedReceiver<CommitBatch>,
}

impl Commits {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<CommitBatch>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<CommitBatch> {
        self.rx.recv().await
    }

    /// see [`process_commits`]
    pub async fn process(self, app: Arc<dyn StateMachine>) -> Result<(), AppError> {
        process_commits(self, app).await
    }
}

/// feed every batch to the application until the pipeline closes
///
/// snapshot batches are restored and completed here; every other batch is
/// handed to apply_commits, which completes it
pub async fn process_commits(
    mut commits: Commits,
    app: Arc<dyn StateMachine>,
) -> Result<(), AppError> {
    while let Some(batch) = commits.recv().await {
        if let BatchKind::Snapshot(snapshot) = &batch.kind {
            app.restore_snapshot(&snapshot.data)?;
            batch.complete();
            continue;
        }
        app.apply_commits(batch).await?;
    }
    Ok(())
}

/// what a batch leaves applied once it is acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Applied {
    pub index: u64,
    pub term: u64,
    pub config: ClusterConfig,
}

struct PendingAck {
    applied: Applied,
    rx: oneshot::Receiver<()>,
}

/// outstanding completion signals in publish order
#[derive(Default)]
pub(crate) struct AckQueue {
    pending: VecDeque<PendingAck>,
    abandoned: bool,
}

impl AckQueue {
    /// ignored once abandoned: nothing would ever resolve it
    pub fn push(&mut self, applied: Applied, rx: oneshot::Receiver<()>) {
        if self.abandoned {
            return;
        }
        self.pending.push_back(PendingAck { applied, rx });
    }

    /// false once a signal was dropped: later acks can no longer be trusted
    pub fn is_waiting(&self) -> bool {
        !self.abandoned && !self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// wait for the oldest outstanding batch; cancel safe
    ///
    /// None means its signal was dropped without completing
    pub async fn next(&mut self) -> Option<Applied> {
        let front = self.pending.front_mut()?;
        let result = (&mut front.rx).await;
        let ack = self.pending.pop_front()?;
        match result {
            Ok(()) => Some(ack.applied),
            Err(_) => {
                self.abandoned = true;
                self.pending.clear();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    fn applied(index: u64) -> Applied {
        Applied {
            index,
            term: 1,
            config: ClusterConfig::default(),
        }
    }

    fn entries_batch(first: u64, commands: &[&str]) -> (CommitBatch, oneshot::Receiver<()>) {
        let items = commands
            .iter()
            .zip(first..)
            .map(|(c, index)| Committed::Command {
                index,
                data: c.as_bytes().to_vec(),
            })
            .collect::<Vec<_>>();
        let last = first + items.len() as u64 - 1;
        let (signal, rx) = CompletionSignal::new();
        (
            CommitBatch::new(first, last, BatchKind::Entries(items), signal),
            rx,
        )
    }

    #[test]
    fn commands_skip_membership_items() {
        let (signal, _rx) = CompletionSignal::new();
        let batch = CommitBatch::new(
            1,
            2,
            BatchKind::Entries(vec![
                Committed::Membership {
                    index: 1,
                    change: ConfigurationChange::add_member(1, "mem://1"),
                },
                Committed::Command {
                    index: 2,
                    data: b"set".to_vec(),
                },
            ]),
            signal,
        );

        assert_eq!(batch.commands().collect::<Vec<_>>(), vec![b"set".as_slice()]);
    }

    #[tokio::test]
    async fn acks_resolve_in_publish_order() {
        let mut queue = AckQueue::default();
        let (first, rx1) = CompletionSignal::new();
        let (second, rx2) = CompletionSignal::new();
        queue.push(applied(3), rx1);
        queue.push(applied(5), rx2);

        second.complete();
        first.complete();

        assert_eq!(queue.next().await.map(|a| a.index), Some(3));
        assert_eq!(queue.next().await.map(|a| a.index), Some(5));
        assert!(!queue.is_waiting());
    }

    #[tokio::test]
    async fn dropped_signal_abandons_the_queue() {
        let mut queue = AckQueue::default();
        let (first, rx1) = CompletionSignal::new();
        let (second, rx2) = CompletionSignal::new();
        queue.push(applied(3), rx1);
        queue.push(applied(5), rx2);

        drop(first);
        second.complete();

        assert_eq!(queue.next().await, None);
        assert!(!queue.is_waiting());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn abandoned_queue_stops_tracking_new_batches() {
        let mut queue = AckQueue::default();
        let (first, rx) = CompletionSignal::new();
        queue.push(applied(1), rx);
        drop(first);
        assert_eq!(queue.next().await, None);

        let mut signals = Vec::new();
        for index in 2..1002 {
            let (signal, rx) = CompletionSignal::new();
            queue.push(applied(index), rx);
            signals.push(signal);
        }

        assert_eq!(queue.len(), 0);
        assert!(!queue.is_waiting());
    }

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        restored: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl StateMachine for Recorder {
        async fn apply_commits(&self, batch: CommitBatch) -> Result<(), AppError> {
            self.commands.lock().unwrap().extend(
                batch
                    .commands()
                    .map(|c| String::from_utf8_lossy(c).into_owned()),
            );
            batch.complete();
            Ok(())
        }

        fn take_snapshot(&self) -> Result<Vec<u8>, AppError> {
            Ok(Vec::new())
        }

        fn restore_snapshot(&self, data: &[u8]) -> Result<(), AppError> {
            self.restored.lock().unwrap().push(data.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn process_commits_restores_and_applies_until_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Arc::new(Recorder::default());

        let (snap_signal, snap_rx) = CompletionSignal::new();
        let snapshot = Snapshot::new(4, 1, ClusterConfig::default(), b"image".to_vec());
        tx.send(CommitBatch::new(4, 4, BatchKind::Snapshot(snapshot), snap_signal))
            .unwrap();
        let (batch, batch_rx) = entries_batch(5, &["a", "b"]);
        tx.send(batch).unwrap();
        drop(tx);

        process_commits(Commits::new(rx), app.clone()).await.unwrap();

        assert_eq!(*app.restored.lock().unwrap(), vec![b"image".to_vec()]);
        assert_eq!(*app.commands.lock().unwrap(), vec!["a", "b"]);
        assert!(snap_rx.await.is_ok());
        assert!(batch_rx.await.is_ok());
    }
}
