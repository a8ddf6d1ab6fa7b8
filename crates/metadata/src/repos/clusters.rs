//! Cluster repository.

use crate::error::MetadataResult;
use crate::models::{ClusterRow, ClusterUpdate, NewCluster};
use async_trait::async_trait;
use meridian_core::NodeRole;

#[async_trait]
pub trait ClusterRepo: Send + Sync {
    async fn create_cluster(&self, cluster: &NewCluster) -> MetadataResult<ClusterRow>;

    async fn get_cluster(&self, cluster_id: i64) -> MetadataResult<Option<ClusterRow>>;

    /// Ordered by id. `role` filters by role; `enabled_only` hides disabled clusters.
    async fn list_clusters(
        &self,
        role: Option<NodeRole>,
        enabled_only: bool,
    ) -> MetadataResult<Vec<ClusterRow>>;

    async fn update_cluster(
        &self,
        cluster_id: i64,
        update: &ClusterUpdate,
    ) -> MetadataResult<ClusterRow>;

    /// Soft delete: disables the cluster and drops its pending cluster tasks.
    async fn disable_cluster(&self, cluster_id: i64) -> MetadataResult<()>;
}
