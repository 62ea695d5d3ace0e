//! Meridian Metadata Store - replicated metadata state core
//!
//! This crate keeps a node's catalog metadata consistent with the cluster:
//! a durable journal of operations, the in-memory store they are applied
//! to, checkpoint images, replay for recovery and follower catch-up, and
//! the leader/follower role machinery. [`StateCoordinator`] ties it all
//! together.

pub mod checkpoint;
pub mod context;
pub mod coordinator;
pub mod election;
pub mod journal;
pub mod locks;
pub mod metric_definitions;
pub mod replay;
pub mod role;
pub mod state;
mod task;
pub mod transport;

// Re-exports
pub use checkpoint::{CheckpointInfo, CheckpointManager};
pub use context::RequestContext;
pub use coordinator::{NodeStatus, StateCoordinator, SubmitReceipt};
pub use election::{LeaderElection, LocalElection};
pub use journal::{FileJournal, JournalEntry, JournalStore, MemoryJournal};
pub use locks::RegionLocks;
pub use replay::{ReplayPolicy, ReplayStats, Replayer};
pub use role::{RoleCoordinator, RoleState};
pub use state::{EntityKind, EntitySnapshot, MetadataState, MetadataStore, OpCode, Operation};
pub use transport::{
    CoordinatorSource, JournalSource, ReplicationSource, SourceConnector, StaticConnector,
};
