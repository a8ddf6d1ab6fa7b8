//! Primary election for the cluster-wide background loops.
//!
//! Every leader-gated loop asks [`LeadershipOracle::is_primary`] at the start
//! of each tick. The answer is never cached across ticks, so a demoted
//! instance stops acting within one interval.

use async_trait::async_trait;
use meridian_core::config::LeaderConfig;
use meridian_metadata::MetadataStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

#[async_trait]
pub trait LeadershipOracle: Send + Sync {
    async fn is_primary(&self) -> bool;
}

/// Fixed answer. Flipping it at runtime is supported for tests and manual
/// failover.
#[derive(Debug)]
pub struct StaticLeadership {
    primary: AtomicBool,
}

impl StaticLeadership {
    pub fn new(primary: bool) -> Self {
        Self {
            primary: AtomicBool::new(primary),
        }
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeadershipOracle for StaticLeadership {
    async fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }
}

/// Lease row in the metadata store, taken or renewed on every check.
pub struct LeaseLeadership {
    metadata: Arc<dyn MetadataStore>,
    instance_id: String,
    ttl: Duration,
}

impl LeaseLeadership {
    pub fn new(metadata: Arc<dyn MetadataStore>, instance_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            metadata,
            instance_id: instance_id.into(),
            ttl,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[async_trait]
impl LeadershipOracle for LeaseLeadership {
    async fn is_primary(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.ttl;
        match self
            .metadata
            .try_acquire_lease(&self.instance_id, now, expires_at)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                // A store we cannot reach must not leave two primaries.
                tracing::warn!(instance_id = %self.instance_id, error = %e, "Leader lease check failed");
                false
            }
        }
    }
}

/// Build the oracle selected by configuration.
pub fn from_config(config: &LeaderConfig, metadata: Arc<dyn MetadataStore>) -> Arc<dyn LeadershipOracle> {
    match config {
        LeaderConfig::Static { is_primary } => Arc::new(StaticLeadership::new(*is_primary)),
        LeaderConfig::Lease {
            instance_id,
            ttl_secs,
        } => {
            let instance_id = instance_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            tracing::info!(instance_id = %instance_id, ttl_secs, "Using lease leadership");
            Arc::new(LeaseLeadership::new(
                metadata,
                instance_id,
                Duration::from_secs(*ttl_secs),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_metadata::SqliteStore;

    async fn store() -> (tempfile::TempDir, Arc<dyn MetadataStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"), None)
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn test_static_leadership_can_flip() {
        let oracle = StaticLeadership::new(false);
        assert!(!oracle.is_primary().await);
        oracle.set_primary(true);
        assert!(oracle.is_primary().await);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let (_dir, metadata) = store().await;
        let a = LeaseLeadership::new(metadata.clone(), "a", Duration::from_secs(30));
        let b = LeaseLeadership::new(metadata.clone(), "b", Duration::from_secs(30));

        assert!(a.is_primary().await);
        assert!(!b.is_primary().await);
        // Renewal by the holder keeps the lease.
        assert!(a.is_primary().await);
    }

    #[tokio::test]
    async fn test_expired_lease_moves() {
        let (_dir, metadata) = store().await;
        let a = LeaseLeadership::new(metadata.clone(), "a", Duration::ZERO);
        let b = LeaseLeadership::new(metadata.clone(), "b", Duration::from_secs(30));

        assert!(a.is_primary().await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(b.is_primary().await);
        assert!(!a.is_primary().await);
    }
}
