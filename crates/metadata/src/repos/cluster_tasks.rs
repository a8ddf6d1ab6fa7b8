//! Cluster task queue and node task repositories.

use crate::error::MetadataResult;
use crate::models::{ClusterTaskRow, FanOut, NodeTaskRow};
use async_trait::async_trait;
use meridian_core::{NodeRole, TaskAck, TaskKind};
use time::OffsetDateTime;

/// Durable queue of "kind K changed for cluster C" markers.
#[async_trait]
pub trait ClusterTaskRepo: Send + Sync {
    /// Insert a pending task or, if one exists for the same scope, bump its
    /// generation. Mutations call the transaction-scoped variant in
    /// [`crate::notifier`]; this one runs in its own transaction.
    async fn enqueue_cluster_task(
        &self,
        role: NodeRole,
        cluster_id: i64,
        node_id: i64,
        kind: TaskKind,
    ) -> MetadataResult<()>;

    /// Atomically move up to `limit` pending tasks of `role` (and claims
    /// older than `stale_before`) to extracting, owned by `claimer`.
    async fn claim_cluster_tasks(
        &self,
        role: NodeRole,
        claimer: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ClusterTaskRow>>;

    /// Upsert node tasks for the task's target nodes, then consume the task
    /// if it was not re-notified meanwhile.
    async fn fan_out_cluster_task(&self, task: &ClusterTaskRow) -> MetadataResult<FanOut>;

    /// Return a claimed task to pending after a failed fan-out.
    async fn release_cluster_task(&self, task_id: i64) -> MetadataResult<()>;

    async fn list_cluster_tasks(&self, role: Option<NodeRole>)
    -> MetadataResult<Vec<ClusterTaskRow>>;

    async fn delete_cluster_tasks_for_cluster(&self, cluster_id: i64) -> MetadataResult<u64>;

    /// Drop node-scoped cluster tasks and node tasks of one node.
    async fn delete_tasks_for_node(&self, node_id: i64) -> MetadataResult<u64>;
}

#[async_trait]
pub trait NodeTaskRepo: Send + Sync {
    async fn list_node_tasks(&self, role: NodeRole, node_id: i64)
    -> MetadataResult<Vec<NodeTaskRow>>;

    /// Acknowledge tasks up to the version the node saw. A row refreshed by a
    /// later fan-out has a higher version and survives. Ids of other nodes
    /// are ignored.
    async fn delete_node_tasks(&self, node_id: i64, acks: &[TaskAck]) -> MetadataResult<u64>;
}
