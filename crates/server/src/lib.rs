//! HTTP control plane for Meridian edge and DNS clusters.
//!
//! This crate provides:
//! - Versioned pull sync for nodes
//! - Cluster task extraction into per-node tasks
//! - Active health checks and passive inactivity monitoring
//! - Correlated request/reply over node command streams
//! - Admin endpoints (clusters, DNS, tokens, messages)

pub mod auth;
pub mod background;
pub mod bootstrap;
pub mod error;
pub mod extractor;
pub mod handlers;
pub mod leader;
pub mod liveness;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod stream;

pub use auth::TraceId;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
