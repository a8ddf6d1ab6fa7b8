//! Passive liveness: nodes that stop sending heartbeats.

use crate::background;
use crate::leader::LeadershipOracle;
use crate::metrics;
use async_trait::async_trait;
use meridian_core::config::InactivityConfig;
use meridian_core::{MessageKind, NodeKey, NodeRole};
use meridian_metadata::models::{ClusterRow, NewMessage, NodeRow};
use meridian_metadata::{MetadataResult, MetadataStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum RemoteStartError {
    #[error("remote start is not configured")]
    NotConfigured,

    #[error("remote start failed: {0}")]
    Failed(String),
}

/// Starts the node process on a silent machine (SSH or similar).
#[async_trait]
pub trait RemoteStarter: Send + Sync {
    async fn start(&self, node: &NodeRow) -> Result<(), RemoteStartError>;
}

#[derive(Debug, Default)]
pub struct DisabledRemoteStarter;

#[async_trait]
impl RemoteStarter for DisabledRemoteStarter {
    async fn start(&self, _node: &NodeRow) -> Result<(), RemoteStartError> {
        Err(RemoteStartError::NotConfigured)
    }
}

#[derive(Debug, Clone, Copy)]
struct StartAttempts {
    tries: u32,
    cooldown_until: Option<Instant>,
}

/// Retry budget per node: `max_tries` attempts, then a cooldown.
#[derive(Debug)]
pub struct RemoteStartTracker {
    max_tries: u32,
    cooldown: Duration,
    attempts: HashMap<NodeKey, StartAttempts>,
}

impl RemoteStartTracker {
    pub fn new(max_tries: u32, cooldown: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            cooldown,
            attempts: HashMap::new(),
        }
    }

    pub fn should_attempt(&mut self, key: NodeKey, now: Instant) -> bool {
        let Some(entry) = self.attempts.get_mut(&key) else {
            return true;
        };
        match entry.cooldown_until {
            Some(until) if now < until => false,
            Some(_) => {
                entry.tries = 0;
                entry.cooldown_until = None;
                true
            }
            None => entry.tries < self.max_tries,
        }
    }

    /// Count one attempt. Returns true when the budget is now spent and the
    /// node enters its cooldown.
    pub fn record_attempt(&mut self, key: NodeKey, now: Instant) -> bool {
        let entry = self.attempts.entry(key).or_insert(StartAttempts {
            tries: 0,
            cooldown_until: None,
        });
        entry.tries += 1;
        if entry.tries >= self.max_tries {
            entry.cooldown_until = Some(now + self.cooldown);
            true
        } else {
            false
        }
    }

    pub fn forget(&mut self, key: &NodeKey) {
        self.attempts.remove(key);
    }

    pub fn retain(&mut self, keep: &HashSet<NodeKey>) {
        self.attempts.retain(|key, _| keep.contains(key));
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// Consecutive-silent-tick counters and notification throttling.
#[derive(Debug)]
pub struct InactivityTracker {
    notify_after_ticks: u32,
    quiet_period: time::Duration,
    counters: HashMap<NodeKey, u32>,
    // Survives the node coming back, so a flapping node stays throttled.
    notified_at: HashMap<NodeKey, OffsetDateTime>,
}

impl InactivityTracker {
    pub fn new(notify_after_ticks: u32, quiet_period: time::Duration) -> Self {
        Self {
            notify_after_ticks: notify_after_ticks.max(1),
            quiet_period,
            counters: HashMap::new(),
            notified_at: HashMap::new(),
        }
    }

    /// Count one silent tick. Returns true when a notification is due, in
    /// which case the counter is reset and the notification time recorded.
    pub fn observe(&mut self, key: NodeKey, stored_notified_at: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
        let count = self.counters.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        if *count < self.notify_after_ticks {
            return false;
        }

        let last = match (stored_notified_at, self.notified_at.get(&key).copied()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if let Some(last) = last
            && now - last < self.quiet_period
        {
            return false;
        }

        self.counters.remove(&key);
        self.notified_at.insert(key, now);
        true
    }

    /// Drop counters of nodes that are no longer silent and notification
    /// times older than the quiet period.
    pub fn retain(&mut self, silent: &HashSet<NodeKey>, now: OffsetDateTime) {
        self.counters.retain(|key, _| silent.contains(key));
        let quiet_period = self.quiet_period;
        self.notified_at.retain(|_, at| now - *at < quiet_period);
    }

    pub fn count(&self, key: &NodeKey) -> u32 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.counters.len()
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InactivityReport {
    pub skipped: bool,
    pub silent: usize,
    pub deactivated: usize,
    pub notified: usize,
    pub start_attempts: usize,
}

struct MonitorState {
    inactivity: InactivityTracker,
    remote_start: RemoteStartTracker,
}

pub struct InactivityMonitor {
    metadata: Arc<dyn MetadataStore>,
    leader: Arc<dyn LeadershipOracle>,
    starter: Arc<dyn RemoteStarter>,
    config: InactivityConfig,
    // Only the monitor's own loop takes this lock.
    state: Mutex<MonitorState>,
}

impl InactivityMonitor {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        leader: Arc<dyn LeadershipOracle>,
        starter: Arc<dyn RemoteStarter>,
        config: InactivityConfig,
    ) -> Self {
        let state = MonitorState {
            inactivity: InactivityTracker::new(config.notify_after_ticks, config.quiet_period()),
            remote_start: RemoteStartTracker::new(
                config.remote_start_max_tries,
                config.remote_start_cooldown(),
            ),
        };
        Self {
            metadata,
            leader,
            starter,
            config,
            state: Mutex::new(state),
        }
    }

    pub async fn tick(&self) -> MetadataResult<InactivityReport> {
        self.tick_at(OffsetDateTime::now_utc()).await
    }

    /// Tick with an explicit wall clock.
    pub async fn tick_at(&self, now: OffsetDateTime) -> MetadataResult<InactivityReport> {
        let mut report = InactivityReport::default();
        if !self.leader.is_primary().await {
            report.skipped = true;
            return Ok(report);
        }

        let mut state = self.state.lock().await;
        let seen_before = now - self.config.inactive_after();
        let mut silent_keys = HashSet::new();

        for role in NodeRole::ALL {
            for cluster in self.metadata.list_clusters(Some(role), true).await? {
                let silent = match self.metadata.find_silent_nodes(cluster.id, seen_before).await {
                    Ok(silent) => silent,
                    Err(e) => {
                        tracing::error!(cluster_id = cluster.id, error = %e, "Failed to list silent nodes");
                        // Keep this cluster's counters until it can be read again.
                        for node in self.metadata.list_nodes(cluster.id).await.unwrap_or_default() {
                            silent_keys.insert(NodeKey::new(cluster.id, node.id));
                        }
                        continue;
                    }
                };

                for node in silent {
                    let key = NodeKey::new(cluster.id, node.id);
                    silent_keys.insert(key);
                    report.silent += 1;
                    if let Err(e) = self
                        .handle_silent(&mut state, role, &cluster, &node, key, now, &mut report)
                        .await
                    {
                        tracing::error!(cluster_id = cluster.id, node_id = node.id, error = %e, "Failed to process silent node");
                    }
                }
            }
        }

        state.inactivity.retain(&silent_keys, now);
        state.remote_start.retain(&silent_keys);

        if report.silent > 0 {
            tracing::debug!(
                silent = report.silent,
                deactivated = report.deactivated,
                notified = report.notified,
                start_attempts = report.start_attempts,
                "Inactivity check finished"
            );
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_silent(
        &self,
        state: &mut MonitorState,
        role: NodeRole,
        cluster: &ClusterRow,
        node: &NodeRow,
        key: NodeKey,
        now: OffsetDateTime,
        report: &mut InactivityReport,
    ) -> MetadataResult<()> {
        if self.metadata.set_node_active(node.id, false).await? {
            report.deactivated += 1;
            tracing::info!(cluster_id = cluster.id, node_id = node.id, "Node marked inactive");
        }

        if cluster.auto_remote_start {
            self.try_remote_start(state, role, cluster, node, key, report)
                .await?;
        }

        if state.inactivity.observe(key, node.inactive_notified_at, now) {
            self.metadata
                .create_message(&NewMessage {
                    role,
                    cluster_id: cluster.id,
                    node_id: node.id,
                    kind: MessageKind::NodeInactive,
                    level: MessageKind::NodeInactive.default_level(),
                    subject: format!("Node \"{}\" is inactive", node.name),
                    body: match node.last_seen_at {
                        Some(at) => format!("no heartbeat since {at}"),
                        None => "no heartbeat received yet".to_string(),
                    },
                })
                .await?;
            self.metadata.mark_inactive_notified(node.id, now).await?;
            metrics::INACTIVITY_NOTIFICATIONS.inc();
            report.notified += 1;
        }
        Ok(())
    }

    async fn try_remote_start(
        &self,
        state: &mut MonitorState,
        role: NodeRole,
        cluster: &ClusterRow,
        node: &NodeRow,
        key: NodeKey,
        report: &mut InactivityReport,
    ) -> MetadataResult<()> {
        let started = Instant::now();
        if !state.remote_start.should_attempt(key, started) {
            return Ok(());
        }

        report.start_attempts += 1;
        match self.starter.start(node).await {
            Ok(()) => {
                metrics::REMOTE_START_ATTEMPTS.with_label_values(&["ok"]).inc();
                tracing::info!(cluster_id = cluster.id, node_id = node.id, "Remote start issued");
                state.remote_start.forget(&key);
            }
            Err(e) => {
                metrics::REMOTE_START_ATTEMPTS.with_label_values(&["failed"]).inc();
                tracing::warn!(cluster_id = cluster.id, node_id = node.id, error = %e, "Remote start failed");
                if state.remote_start.record_attempt(key, started) {
                    self.metadata
                        .create_message(&NewMessage {
                            role,
                            cluster_id: cluster.id,
                            node_id: node.id,
                            kind: MessageKind::RemoteStartFailed,
                            level: MessageKind::RemoteStartFailed.default_level(),
                            subject: format!("Could not start node \"{}\" remotely", node.name),
                            body: e.to_string(),
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        background::spawn_loop("inactivity", interval, move || {
            let monitor = self.clone();
            async move { monitor.tick().await.map(|_| ()) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(node_id: i64) -> NodeKey {
        NodeKey::new(1, node_id)
    }

    #[test]
    fn test_notifies_after_threshold_ticks() {
        let mut tracker = InactivityTracker::new(3, time::Duration::hours(1));
        let now = OffsetDateTime::now_utc();

        assert!(!tracker.observe(key(1), None, now));
        assert!(!tracker.observe(key(1), None, now));
        assert!(tracker.observe(key(1), None, now));
        assert_eq!(tracker.count(&key(1)), 0);
    }

    #[test]
    fn test_quiet_period_throttles_repeat_notifications() {
        let mut tracker = InactivityTracker::new(1, time::Duration::hours(1));
        let start = OffsetDateTime::now_utc();

        assert!(tracker.observe(key(1), None, start));
        // Node came back, then went silent again within the hour.
        tracker.retain(&HashSet::new(), start + time::Duration::minutes(10));
        assert!(!tracker.observe(key(1), None, start + time::Duration::minutes(20)));
        assert!(tracker.observe(key(1), None, start + time::Duration::minutes(61)));
    }

    #[test]
    fn test_stored_notification_time_is_honoured() {
        let mut tracker = InactivityTracker::new(1, time::Duration::hours(1));
        let now = OffsetDateTime::now_utc();
        let stored = now - time::Duration::minutes(5);

        assert!(!tracker.observe(key(1), Some(stored), now));
    }

    #[test]
    fn test_recovered_nodes_lose_their_counters() {
        let mut tracker = InactivityTracker::new(5, time::Duration::hours(1));
        let now = OffsetDateTime::now_utc();
        tracker.observe(key(1), None, now);
        tracker.observe(key(2), None, now);

        let silent: HashSet<_> = [key(2)].into_iter().collect();
        tracker.retain(&silent, now);

        assert_eq!(tracker.tracked(), 1);
        assert_eq!(tracker.count(&key(1)), 0);
        assert_eq!(tracker.count(&key(2)), 1);
    }

    #[test]
    fn test_remote_start_budget_and_cooldown() {
        let mut tracker = RemoteStartTracker::new(3, Duration::from_secs(600));
        let t0 = Instant::now();

        for _ in 0..2 {
            assert!(tracker.should_attempt(key(1), t0));
            assert!(!tracker.record_attempt(key(1), t0));
        }
        assert!(tracker.should_attempt(key(1), t0));
        assert!(tracker.record_attempt(key(1), t0));

        assert!(!tracker.should_attempt(key(1), t0 + Duration::from_secs(599)));
        assert!(tracker.should_attempt(key(1), t0 + Duration::from_secs(601)));
    }

    #[test]
    fn test_remote_start_tracker_prunes() {
        let mut tracker = RemoteStartTracker::new(3, Duration::from_secs(600));
        let now = Instant::now();
        tracker.record_attempt(key(1), now);
        tracker.record_attempt(key(2), now);

        tracker.retain(&[key(2)].into_iter().collect());
        assert_eq!(tracker.len(), 1);
    }
}
