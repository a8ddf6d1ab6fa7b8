//! Node liveness detection.
//!
//! Two independent loops feed the node's versioned state:
//! - [`health_check`] actively probes every node over HTTP through a bounded
//!   worker pool and debounces the outcome.
//! - [`inactivity`] watches for nodes whose heartbeats stopped and raises
//!   throttled notifications, optionally trying to start them remotely.

pub mod health_check;
pub mod inactivity;

pub use health_check::{HealthCheckExecutor, HealthCheckResult, HealthCheckScheduler};
pub use inactivity::{
    DisabledRemoteStarter, InactivityMonitor, InactivityReport, InactivityTracker, RemoteStartError,
    RemoteStartTracker, RemoteStarter,
};
