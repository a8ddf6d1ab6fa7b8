//! Leader-gated expansion of cluster tasks into node tasks.

use crate::background;
use crate::leader::LeadershipOracle;
use crate::metrics;
use crate::stream::CommandHub;
use meridian_core::NodeRole;
use meridian_core::config::TasksConfig;
use meridian_metadata::models::ClusterTaskRow;
use meridian_metadata::{MetadataResult, MetadataStore};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    /// The instance was not primary and did nothing.
    pub skipped: bool,
    pub claimed: usize,
    /// Tasks consumed after fan-out.
    pub extracted: usize,
    /// Re-notified during fan-out and returned to pending.
    pub requeued: usize,
    pub failed: usize,
    pub node_tasks: usize,
    pub nudged: usize,
}

pub struct TaskExtractor {
    metadata: Arc<dyn MetadataStore>,
    leader: Arc<dyn LeadershipOracle>,
    hub: Arc<CommandHub>,
    config: TasksConfig,
    claimer: String,
}

impl TaskExtractor {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        leader: Arc<dyn LeadershipOracle>,
        hub: Arc<CommandHub>,
        config: TasksConfig,
    ) -> Self {
        Self {
            metadata,
            leader,
            hub,
            config,
            claimer: format!("extractor-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Claim and fan out pending tasks of every role.
    ///
    /// A task that fails to fan out is released back to pending and retried
    /// next tick; it never blocks the other tasks of the batch.
    pub async fn tick(&self) -> MetadataResult<ExtractReport> {
        let mut report = ExtractReport::default();
        if !self.leader.is_primary().await {
            tracing::trace!("Not primary, skipping task extraction");
            report.skipped = true;
            return Ok(report);
        }

        for role in NodeRole::ALL {
            if let Err(e) = self.extract_role(role, &mut report).await {
                tracing::error!(role = %role, error = %e, "Failed to claim cluster tasks");
            }
        }

        if report.claimed > 0 {
            tracing::debug!(
                claimed = report.claimed,
                extracted = report.extracted,
                requeued = report.requeued,
                failed = report.failed,
                node_tasks = report.node_tasks,
                "Cluster tasks extracted"
            );
        }
        Ok(report)
    }

    async fn extract_role(&self, role: NodeRole, report: &mut ExtractReport) -> MetadataResult<()> {
        let now = OffsetDateTime::now_utc();
        let stale_before = now - self.config.claim_timeout();
        let tasks = self
            .metadata
            .claim_cluster_tasks(role, &self.claimer, now, stale_before, self.config.claim_batch)
            .await?;
        report.claimed += tasks.len();

        for task in tasks {
            self.extract_one(role, &task, report).await;
        }
        Ok(())
    }

    async fn extract_one(&self, role: NodeRole, task: &ClusterTaskRow, report: &mut ExtractReport) {
        match self.metadata.fan_out_cluster_task(task).await {
            Ok(fan_out) => {
                metrics::CLUSTER_TASKS_EXTRACTED
                    .with_label_values(&[role.as_str()])
                    .inc();
                metrics::NODE_TASKS_CREATED.inc_by(fan_out.node_ids.len() as u64);
                report.node_tasks += fan_out.node_ids.len();
                if fan_out.completed {
                    report.extracted += 1;
                } else {
                    report.requeued += 1;
                }

                for node_id in fan_out.node_ids {
                    if self.hub.notify_new_task(node_id).await {
                        report.nudged += 1;
                    }
                }
            }
            Err(e) => {
                report.failed += 1;
                metrics::CLUSTER_TASKS_FAILED
                    .with_label_values(&[role.as_str()])
                    .inc();
                tracing::error!(
                    task_id = task.id,
                    cluster_id = task.cluster_id,
                    node_id = task.node_id,
                    kind = %task.kind,
                    error = %e,
                    "Cluster task fan-out failed"
                );
                if let Err(e) = self.metadata.release_cluster_task(task.id).await {
                    tracing::warn!(task_id = task.id, error = %e, "Failed to release cluster task");
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        background::spawn_loop("task_extractor", interval, move || {
            let extractor = self.clone();
            async move { extractor.tick().await.map(|_| ()) }
        })
    }
}
