//! Node, address and liveness repository.

use crate::error::MetadataResult;
use crate::models::{NewNode, NewNodeIpAddress, NodeIpAddressRow, NodeRow};
use async_trait::async_trait;
use meridian_core::Thresholds;
use time::OffsetDateTime;

/// Every method that changes what nodes observe bumps the node version and
/// enqueues a cluster task in the same transaction.
#[async_trait]
pub trait NodeRepo: Send + Sync {
    async fn create_node(&self, node: &NewNode) -> MetadataResult<NodeRow>;

    async fn get_node(&self, node_id: i64) -> MetadataResult<Option<NodeRow>>;

    async fn get_node_by_unique_id(&self, unique_id: &str) -> MetadataResult<Option<NodeRow>>;

    /// Every node of a cluster, including disabled ones.
    async fn list_nodes(&self, cluster_id: i64) -> MetadataResult<Vec<NodeRow>>;

    /// Enabled nodes that are switched on.
    async fn list_enabled_nodes(&self, cluster_id: i64) -> MetadataResult<Vec<NodeRow>>;

    /// Tombstone a node and drop its queued tasks.
    async fn disable_node(&self, node_id: i64) -> MetadataResult<i64>;

    async fn add_ip_address(&self, address: &NewNodeIpAddress) -> MetadataResult<NodeIpAddressRow>;

    /// Ordered by sort order, then id.
    async fn list_ip_addresses(&self, node_id: i64) -> MetadataResult<Vec<NodeIpAddressRow>>;

    /// Apply one probe outcome to the node's debounce counters.
    /// Returns the new `is_up` when it flipped.
    async fn update_node_up_count(
        &self,
        node_id: i64,
        ok: bool,
        thresholds: Thresholds,
    ) -> MetadataResult<Option<bool>>;

    /// Same as [`NodeRepo::update_node_up_count`] for one address. A flip
    /// bumps the owning node's version.
    async fn update_ip_up_count(
        &self,
        address_id: i64,
        ok: bool,
        thresholds: Thresholds,
    ) -> MetadataResult<Option<bool>>;

    /// Store a heartbeat. Marks the node active and clears its inactivity
    /// notification marker. Returns true if the node was inactive before.
    async fn record_heartbeat(
        &self,
        node_id: i64,
        status_json: Option<&str>,
        now: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Enabled, switched-on nodes not seen since `seen_before`.
    async fn find_silent_nodes(
        &self,
        cluster_id: i64,
        seen_before: OffsetDateTime,
    ) -> MetadataResult<Vec<NodeRow>>;

    /// Returns true if the flag changed.
    async fn set_node_active(&self, node_id: i64, is_active: bool) -> MetadataResult<bool>;

    async fn mark_inactive_notified(&self, node_id: i64, at: OffsetDateTime)
    -> MetadataResult<()>;
}
