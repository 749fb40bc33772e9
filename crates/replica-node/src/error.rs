//! # error
//!
//! why: one error type for everything that can end a node
//! relations: returned by Node::start and reported through NodeHandle::done
//! what: NodeError, NodeResult

use replica_core::CodecError;
use replica_storage::StorageError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::state_machine::AppError;

/// errors that stop a node; recoverable conditions are logged instead
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("consensus engine: {0}")]
    Engine(#[from] EngineError),

    #[error("application failed to restore snapshot: {0}")]
    Restore(AppError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("committed entries out of order: expected index {expected}, found {found}")]
    OutOfOrder { expected: u64, found: u64 },

    #[error("node stopped without reporting a result")]
    Stopped,
}

pub type NodeResult<T> = Result<T, NodeError>;
