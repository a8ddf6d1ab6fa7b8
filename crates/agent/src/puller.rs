//! Pull loop that keeps a local sink in step with the server.

use crate::client::SyncClient;
use anyhow::Result;
use meridian_core::{
    Checkpoint, EntityKind, NodeRole, SyncSink, TaskAck, TaskKind, dedupe_latest,
};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

const DEFAULT_BATCH_LIMIT: u32 = 500;

/// Poll delay that doubles while nothing changes and resets once rows arrive.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay before the next poll, given whether the last one applied rows.
    pub fn next_delay(&mut self, made_progress: bool) -> Duration {
        if made_progress {
            self.current = self.min;
            return self.current;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Kinds a node of `role` receives.
pub fn kinds_for(role: NodeRole) -> Vec<EntityKind> {
    EntityKind::ALL
        .into_iter()
        .filter(|kind| kind.fixed_role().is_none_or(|r| r == role))
        .collect()
}

/// Applies pulled deltas of every kind the node's role receives to `sink`.
pub struct Puller<S> {
    client: SyncClient,
    role: NodeRole,
    sink: S,
    checkpoints: HashMap<EntityKind, Checkpoint>,
    batch_limit: u32,
    backoff: Backoff,
}

impl<S> Puller<S>
where
    S: SyncSink,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    pub fn new(client: SyncClient, role: NodeRole, sink: S) -> Self {
        Self {
            client,
            role,
            sink,
            checkpoints: HashMap::new(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            backoff: Backoff::default(),
        }
    }

    pub fn with_batch_limit(mut self, limit: u32) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Resume from a persisted checkpoint.
    pub fn with_checkpoint(mut self, kind: EntityKind, version: i64) -> Self {
        self.checkpoints.insert(kind, Checkpoint::new(version));
        self
    }

    pub fn checkpoint(&self, kind: EntityKind) -> i64 {
        self.checkpoints
            .get(&kind)
            .map(Checkpoint::version)
            .unwrap_or(0)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Pull `kind` until the server has nothing newer. Returns rows applied.
    ///
    /// The server may clamp `batch_limit`, so a short page does not mean the
    /// stream is drained. Paging stops on an empty page or a checkpoint that
    /// does not move.
    pub async fn sync_kind(&mut self, kind: EntityKind) -> Result<usize> {
        let mut applied = 0;
        loop {
            let checkpoint = self.checkpoints.entry(kind).or_default();
            let before = checkpoint.version();
            let response = self
                .client
                .pull(kind, before, self.batch_limit)
                .await?;
            if response.rows.is_empty() {
                break;
            }

            let outcome = checkpoint.apply(dedupe_latest(response.rows), &mut self.sink)?;
            applied += outcome.applied();
            tracing::debug!(
                kind = %kind,
                checkpoint = checkpoint.version(),
                upserted = outcome.upserted,
                deleted = outcome.deleted,
                "Applied batch"
            );

            if checkpoint.version() <= before {
                break;
            }
        }
        Ok(applied)
    }

    pub async fn sync_all(&mut self) -> Result<usize> {
        let mut applied = 0;
        for kind in kinds_for(self.role) {
            applied += self.sync_kind(kind).await?;
        }
        Ok(applied)
    }

    /// Pull the kinds named by pending node tasks, then acknowledge them.
    ///
    /// `configChanged` means everything. Tasks are only acknowledged once
    /// their kinds were pulled, so a failed pull leaves them pending.
    pub async fn handle_tasks(&mut self) -> Result<usize> {
        let tasks = self.client.node_tasks().await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let mut kinds = BTreeSet::new();
        for task in &tasks {
            match TaskKind::parse(&task.kind) {
                Ok(kind) => match kind.entity_kind() {
                    Some(entity) => {
                        kinds.insert(entity);
                    }
                    None => kinds.extend(kinds_for(self.role)),
                },
                Err(_) => {
                    tracing::warn!(task_id = task.id, kind = %task.kind, "Ignoring unknown task kind");
                }
            }
        }

        let mut applied = 0;
        for kind in kinds {
            applied += self.sync_kind(kind).await?;
        }

        let acks: Vec<TaskAck> = tasks
            .iter()
            .map(|t| TaskAck {
                id: t.id,
                version: t.version,
            })
            .collect();
        let deleted = self.client.ack_tasks(&acks).await?;
        tracing::debug!(tasks = acks.len(), deleted, applied, "Handled node tasks");
        Ok(applied)
    }

    /// One poll: node tasks first, then every kind.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let from_tasks = self.handle_tasks().await?;
        let from_poll = self.sync_all().await?;
        Ok(from_tasks + from_poll)
    }

    /// Poll forever, backing off while nothing changes or the server is
    /// unreachable. Cancel by dropping or aborting the future.
    pub async fn run(mut self) {
        loop {
            let delay = match self.poll_once().await {
                Ok(applied) => self.backoff.next_delay(applied > 0),
                Err(e) => {
                    tracing::warn!(error = %e, "Sync poll failed");
                    self.backoff.next_delay(false)
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay(false).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        assert_eq!(backoff.next_delay(true), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(false), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(false), Duration::from_secs(2));
    }

    #[test]
    fn test_kinds_for_role() {
        assert_eq!(kinds_for(NodeRole::Node), vec![EntityKind::Node]);
        assert_eq!(kinds_for(NodeRole::Dns).len(), 5);
    }
}
