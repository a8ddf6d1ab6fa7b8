//! Active HTTP probing of a cluster's nodes.
//!
//! A run loads every enabled node of one cluster with its first accessible
//! address, queues them on a channel sized to the node count and lets a
//! bounded set of workers drain it. Every outcome then goes through the
//! node's debounce counters; a flip writes a message and bumps the node
//! version so pulling peers see the new state.

use crate::background;
use crate::leader::LeadershipOracle;
use crate::metrics;
use meridian_core::config::HealthCheckConfig;
use meridian_core::{HealthCheckPolicy, MessageKind, NodeRole};
use meridian_metadata::models::{ClusterRow, NewMessage, NodeIpAddressRow, NodeRow};
use meridian_metadata::{MetadataError, MetadataResult, MetadataStore};
use meridian_signer::{HealthCheckPayload, HealthCheckSigner};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};

/// Header carrying the sealed probe token.
pub const HEALTH_CHECK_HEADER: &str = "X-Meridian-Health-Check-Key";

/// Outcome of probing one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub node_id: i64,
    pub node_name: String,
    /// Probed address, if the node had an accessible one.
    pub ip_address_id: Option<i64>,
    pub ip: Option<String>,
    pub ok: bool,
    /// Last HTTP status seen.
    pub status: Option<u16>,
    /// Last failure of the final try.
    pub error: Option<String>,
    pub tries: u32,
}

struct ProbeTarget {
    node: NodeRow,
    address: Option<NodeIpAddressRow>,
}

pub struct HealthCheckExecutor {
    metadata: Arc<dyn MetadataStore>,
    http: reqwest::Client,
    workers: usize,
    default_policy: HealthCheckPolicy,
}

impl HealthCheckExecutor {
    pub fn new(metadata: Arc<dyn MetadataStore>, config: &HealthCheckConfig) -> MetadataResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("meridian-health-check/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MetadataError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            metadata,
            http,
            workers: config.workers.max(1),
            default_policy: config.policy.clone(),
        })
    }

    /// Cluster policy when it has one, otherwise the configured default.
    pub fn policy_for(&self, cluster: &ClusterRow) -> HealthCheckPolicy {
        cluster
            .health_check_policy()
            .unwrap_or_else(|| self.default_policy.clone())
            .normalized()
    }

    /// Probe every enabled node of a cluster and apply the outcomes.
    ///
    /// Results come back ordered by node id. Failures to persist one outcome
    /// are logged and do not affect the others.
    pub async fn run(&self, cluster_id: i64) -> MetadataResult<Vec<HealthCheckResult>> {
        let cluster = self
            .metadata
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("cluster {cluster_id}")))?;
        let role = cluster.role()?;
        let policy = self.policy_for(&cluster);

        let targets = self.load_targets(cluster_id).await?;
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = self.probe_all(targets, &policy).await;
        results.sort_by_key(|r| r.node_id);

        for result in &results {
            if let Err(e) = self.apply(&cluster, role, &policy, result).await {
                tracing::error!(
                    cluster_id,
                    node_id = result.node_id,
                    error = %e,
                    "Failed to record health check outcome"
                );
            }
        }
        Ok(results)
    }

    async fn load_targets(&self, cluster_id: i64) -> MetadataResult<Vec<ProbeTarget>> {
        let nodes = self.metadata.list_enabled_nodes(cluster_id).await?;
        let mut targets = Vec::with_capacity(nodes.len());
        for node in nodes {
            let address = self
                .metadata
                .list_ip_addresses(node.id)
                .await?
                .into_iter()
                .find(|a| a.is_on && a.can_access);
            targets.push(ProbeTarget { node, address });
        }
        Ok(targets)
    }

    async fn probe_all(&self, targets: Vec<ProbeTarget>, policy: &HealthCheckPolicy) -> Vec<HealthCheckResult> {
        let total = targets.len();
        let (queue_tx, queue_rx) = async_channel::bounded(total);
        for target in targets {
            // Capacity equals the number of targets, so this never waits.
            if queue_tx.send(target).await.is_err() {
                break;
            }
        }
        queue_tx.close();

        let workers = self.workers.min(total);
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let queue = queue_rx.clone();
            let http = self.http.clone();
            let policy = policy.clone();
            pool.spawn(async move {
                let mut done = Vec::new();
                while let Ok(target) = queue.recv().await {
                    done.push(probe(&http, &policy, target).await);
                }
                done
            });
        }
        drop(queue_rx);

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(done) => results.extend(done),
                Err(e) => tracing::error!(error = %e, "Health check worker failed"),
            }
        }
        results
    }

    async fn apply(
        &self,
        cluster: &ClusterRow,
        role: NodeRole,
        policy: &HealthCheckPolicy,
        result: &HealthCheckResult,
    ) -> MetadataResult<()> {
        let thresholds = policy.thresholds();

        if let Some(is_up) = self
            .metadata
            .update_node_up_count(result.node_id, result.ok, thresholds)
            .await?
        {
            metrics::record_flip(is_up);
            let (kind, subject) = if is_up {
                (
                    MessageKind::HealthCheckSuccess,
                    format!("Node \"{}\" passed its health check again", result.node_name),
                )
            } else {
                (
                    MessageKind::HealthCheckFailed,
                    format!("Node \"{}\" failed its health check", result.node_name),
                )
            };
            tracing::info!(cluster_id = cluster.id, node_id = result.node_id, is_up, "Node state changed");
            self.metadata
                .create_message(&NewMessage {
                    role,
                    cluster_id: cluster.id,
                    node_id: result.node_id,
                    kind,
                    level: kind.default_level(),
                    subject,
                    body: describe(result),
                })
                .await?;
        }

        if policy.track_ip_health
            && let Some(address_id) = result.ip_address_id
            && let Some(is_up) = self
                .metadata
                .update_ip_up_count(address_id, result.ok, thresholds)
                .await?
        {
            let ip = result.ip.as_deref().unwrap_or_default();
            let (kind, subject) = if is_up {
                (MessageKind::IpAddressUp, format!("Address {ip} is reachable again"))
            } else {
                (MessageKind::IpAddressDown, format!("Address {ip} is unreachable"))
            };
            self.metadata
                .create_message(&NewMessage {
                    role,
                    cluster_id: cluster.id,
                    node_id: result.node_id,
                    kind,
                    level: kind.default_level(),
                    subject,
                    body: describe(result),
                })
                .await?;
        }
        Ok(())
    }
}

fn describe(result: &HealthCheckResult) -> String {
    match (&result.error, result.status) {
        (Some(error), _) => format!("after {} tries: {error}", result.tries),
        (None, Some(status)) => format!("status {status}"),
        (None, None) => String::new(),
    }
}

async fn probe(http: &reqwest::Client, policy: &HealthCheckPolicy, target: ProbeTarget) -> HealthCheckResult {
    let ProbeTarget { node, address } = target;
    let mut result = HealthCheckResult {
        node_id: node.id,
        node_name: node.name.clone(),
        ip_address_id: address.as_ref().map(|a| a.id),
        ip: address.as_ref().map(|a| a.ip.clone()),
        ok: false,
        status: None,
        error: None,
        tries: 0,
    };

    let Some(address) = address else {
        result.error = Some("no accessible ip".to_string());
        metrics::HEALTH_PROBES.with_label_values(&["failed"]).inc();
        return result;
    };

    let token = match HealthCheckSigner::for_node(&node.unique_id, &node.secret)
        .and_then(|signer| signer.seal(&HealthCheckPayload::now(true)))
    {
        Ok(token) => token,
        Err(e) => {
            result.error = Some(format!("failed to seal probe token: {e}"));
            metrics::HEALTH_PROBES.with_label_values(&["failed"]).inc();
            return result;
        }
    };

    let url = policy.url_for(&address.ip);
    for attempt in 1..=policy.tries {
        result.tries = attempt;
        match http
            .get(&url)
            .header(HEALTH_CHECK_HEADER, &token)
            .timeout(policy.timeout())
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status().as_u16();
                result.status = Some(status);
                if policy.accepts(status) {
                    result.ok = true;
                    result.error = None;
                    break;
                }
                result.error = Some(format!("unexpected status {status}"));
            }
            Err(e) => {
                result.error = Some(e.to_string());
            }
        }

        if attempt < policy.tries {
            tokio::time::sleep(policy.try_delay()).await;
        }
    }

    let outcome = if result.ok { "ok" } else { "failed" };
    metrics::HEALTH_PROBES.with_label_values(&[outcome]).inc();
    if !result.ok {
        tracing::debug!(node_id = node.id, url = %url, error = ?result.error, "Health probe failed");
    }
    result
}

/// Runs the executor for every enabled cluster on each tick of the primary.
pub struct HealthCheckScheduler {
    executor: Arc<HealthCheckExecutor>,
    metadata: Arc<dyn MetadataStore>,
    leader: Arc<dyn LeadershipOracle>,
}

impl HealthCheckScheduler {
    pub fn new(
        executor: Arc<HealthCheckExecutor>,
        metadata: Arc<dyn MetadataStore>,
        leader: Arc<dyn LeadershipOracle>,
    ) -> Self {
        Self {
            executor,
            metadata,
            leader,
        }
    }

    /// Returns the number of clusters probed.
    pub async fn tick(&self) -> MetadataResult<usize> {
        if !self.leader.is_primary().await {
            return Ok(0);
        }

        let mut probed = 0;
        for role in NodeRole::ALL {
            for cluster in self.metadata.list_clusters(Some(role), true).await? {
                if !self.executor.policy_for(&cluster).enabled {
                    continue;
                }
                match self.executor.run(cluster.id).await {
                    Ok(results) => {
                        probed += 1;
                        let failed = results.iter().filter(|r| !r.ok).count();
                        tracing::debug!(cluster_id = cluster.id, nodes = results.len(), failed, "Cluster health checked");
                    }
                    Err(e) => {
                        tracing::error!(cluster_id = cluster.id, error = %e, "Cluster health check failed");
                    }
                }
            }
        }
        Ok(probed)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        background::spawn_loop("health_check", interval, move || {
            let scheduler = self.clone();
            async move { scheduler.tick().await.map(|_| ()) }
        })
    }
}
