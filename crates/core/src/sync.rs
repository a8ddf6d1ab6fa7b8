//! Node-side application of version-ordered deltas.

use crate::entity::{EntityDelta, EntityKind};
use std::collections::{BTreeMap, HashMap};

/// Local state a node applies pulled deltas to.
pub trait SyncSink {
    type Error;

    fn upsert(&mut self, row: &EntityDelta) -> Result<(), Self::Error>;

    fn delete(&mut self, kind: EntityKind, id: i64) -> Result<(), Self::Error>;
}

/// Outcome of applying one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub upserted: usize,
    pub deleted: usize,
    /// Rows at or below the checkpoint, already applied earlier.
    pub skipped: usize,
}

impl ApplyOutcome {
    pub fn applied(&self) -> usize {
        self.upserted + self.deleted
    }
}

/// Highest version of one entity kind a node has applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checkpoint {
    version: i64,
}

impl Checkpoint {
    pub fn new(version: i64) -> Self {
        Self {
            version: version.max(0),
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Apply a batch in version order.
    ///
    /// The checkpoint advances row by row, so an error leaves it at the last
    /// row that was applied and the rest of the batch is pulled again.
    pub fn apply<S: SyncSink>(
        &mut self,
        mut batch: Vec<EntityDelta>,
        sink: &mut S,
    ) -> Result<ApplyOutcome, S::Error> {
        batch.sort_by_key(|row| row.version);

        let mut outcome = ApplyOutcome::default();
        for row in &batch {
            if row.version <= self.version {
                outcome.skipped += 1;
                continue;
            }
            if row.is_deleted {
                sink.delete(row.kind, row.id)?;
                outcome.deleted += 1;
            } else {
                sink.upsert(row)?;
                outcome.upserted += 1;
            }
            self.version = row.version;
        }
        Ok(outcome)
    }
}

/// Collapse a batch to the latest version of each id, ordered by version.
pub fn dedupe_latest(rows: Vec<EntityDelta>) -> Vec<EntityDelta> {
    let mut latest: HashMap<(EntityKind, i64), EntityDelta> = HashMap::with_capacity(rows.len());
    for row in rows {
        match latest.get(&(row.kind, row.id)) {
            Some(existing) if existing.version >= row.version => {}
            _ => {
                latest.insert((row.kind, row.id), row);
            }
        }
    }
    let mut out: Vec<_> = latest.into_values().collect();
    out.sort_by_key(|row| row.version);
    out
}

/// In-memory sink keyed by kind and id.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: BTreeMap<(EntityKind, i64), EntityDelta>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind, id: i64) -> Option<&EntityDelta> {
        self.rows.get(&(kind, id))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl SyncSink for MemorySink {
    type Error = std::convert::Infallible;

    fn upsert(&mut self, row: &EntityDelta) -> Result<(), Self::Error> {
        self.rows.insert((row.kind, row.id), row.clone());
        Ok(())
    }

    fn delete(&mut self, kind: EntityKind, id: i64) -> Result<(), Self::Error> {
        self.rows.remove(&(kind, id));
        Ok(())
    }
}
