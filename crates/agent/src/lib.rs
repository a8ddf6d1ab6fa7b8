//! Node-side client for the Meridian control plane.
//!
//! A node keeps one [`Checkpoint`](meridian_core::Checkpoint) per entity
//! kind and repeatedly asks the server for rows changed after it. Node tasks
//! tell it which kinds changed so it can pull them without waiting for the
//! next poll.

pub mod client;
pub mod puller;

pub use client::{HeartbeatResponse, NodeTask, SyncClient};
pub use puller::{Backoff, Puller};
