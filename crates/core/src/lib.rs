//! Core domain types for the Meridian control plane.
//!
//! Nothing in this crate performs I/O. It defines:
//! - Cluster roles, entity kinds and their version namespaces
//! - Cluster/node task kinds
//! - The debounced liveness state machine and probe policy
//! - Node-side checkpoint application of pulled deltas
//! - The command stream envelope
//! - Admin token scopes and configuration

pub mod cluster;
pub mod command;
pub mod config;
pub mod entity;
pub mod error;
pub mod liveness;
pub mod message;
pub mod sync;
pub mod task;
pub mod token;

pub use cluster::{ALL_NODES, ClusterId, NodeId, NodeKey, NodeRole};
pub use command::CommandMessage;
pub use entity::{EntityDelta, EntityKind, EntityState, ListAfterVersionResponse};
pub use error::{Error, Result};
pub use liveness::{HealthCheckPolicy, Thresholds, UpDownCounter};
pub use message::{MessageKind, MessageLevel};
pub use sync::{ApplyOutcome, Checkpoint, MemorySink, SyncSink, dedupe_latest};
pub use task::{TaskAck, TaskKind};
pub use token::{Token, TokenId, TokenScope};
