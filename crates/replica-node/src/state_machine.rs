//! # state_machine
//!
//! why: the contract between a node and the application it replicates
//! relations: batches come from pipeline.rs; take_snapshot is called by driver.rs on ack,
//! restore_snapshot at startup and for installed snapshots
//! what: StateMachine trait, AppError

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::CommitBatch;

/// failure reported by the application
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct AppError(pub String);

impl AppError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Application state machine driven by committed entries
///
/// applying a batch must be deterministic; a batch counts as applied only once
/// its completion signal fires, and only applied state may appear in a snapshot
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// apply every command in the batch, then complete it
    async fn apply_commits(&self, batch: CommitBatch) -> Result<(), AppError>;

    /// serialize the applied state
    fn take_snapshot(&self) -> Result<Vec<u8>, AppError>;

    /// replace the applied state with a snapshot image
    fn restore_snapshot(&self, data: &[u8]) -> Result<(), AppError>;
}
