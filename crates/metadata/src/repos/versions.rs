//! Version counter repository.

use crate::error::MetadataResult;
use async_trait::async_trait;

/// Per-namespace monotonic counters.
#[async_trait]
pub trait VersionRepo: Send + Sync {
    /// Increment a namespace in its own transaction and return the new value.
    /// The first increment of an unknown namespace returns 1.
    async fn increase_version(&self, namespace: &str) -> MetadataResult<i64>;

    /// Current value, 0 for a namespace never incremented.
    async fn current_version(&self, namespace: &str) -> MetadataResult<i64>;
}
