//! Health check tokens for Meridian nodes.
//!
//! This crate provides:
//! - Per-node AES-256 key derivation from the node's credentials
//! - Sealing of the probe payload into a header-safe token
//! - Opening and freshness checks on the node side

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::NodeKey;
pub use signer::{HealthCheckPayload, HealthCheckSigner};
