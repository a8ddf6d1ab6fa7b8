//! Application state shared across handlers.

use crate::leader::LeadershipOracle;
use crate::stream::CommandHub;
use meridian_core::config::AppConfig;
use meridian_metadata::MetadataStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Connected node streams and pending command replies.
    pub hub: Arc<CommandHub>,
    /// Decides which instance runs the cluster-wide loops.
    pub leader: Arc<dyn LeadershipOracle>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        leader: Arc<dyn LeadershipOracle>,
    ) -> Self {
        let hub = Arc::new(CommandHub::new(config.command_stream.queue_capacity));
        Self {
            config: Arc::new(config),
            metadata,
            hub,
            leader,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::StaticLeadership;
    use meridian_metadata::SqliteStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_state_starts_with_no_streams() {
        let temp = tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(temp.path().join("metadata.db"), None)
                .await
                .unwrap(),
        );
        let state = AppState::new(
            AppConfig::for_testing(),
            metadata,
            Arc::new(StaticLeadership::new(true)),
        );

        assert_eq!(state.hub.connected_count().await, 0);
        assert!(state.leader.is_primary().await);
    }
}
