//! # replica-node
//!
//! why: host an application state machine on a consensus log that survives crashes and
//! membership changes
//! relations: persists through replica-storage, speaks replica-core types, runs raft-rs
//! behind engine::ConsensusEngine
//! what: Node driver, commit pipeline, membership manager, transport, configuration

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod membership;
pub mod pipeline;
pub mod state_machine;
pub mod transport;

pub use config::NodeConfig;
pub use driver::{wait_for_leader, Done, Node, NodeHandle, NodeParts, NodeStatus};
pub use engine::{ConsensusEngine, EngineError, Envelope, RaftEngine, Role};
pub use error::{NodeError, NodeResult};
pub use membership::MembershipTable;
pub use pipeline::{process_commits, BatchKind, CommitBatch, Commits, Committed, CompletionSignal};
pub use state_machine::{AppError, StateMachine};
pub use transport::{MemoryNetwork, MemoryTransport, Transport};
