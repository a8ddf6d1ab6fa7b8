//! Counters for the change pipeline.
//!
//! They are bumped by the notifier itself, so every version increment and
//! cluster task upsert is counted no matter which caller triggered it.
//! `meridian-server` registers them with its registry.

use prometheus::{IntCounterVec, Opts};
use std::sync::LazyLock;

pub static VERSION_INCREMENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_version_increments_total",
            "Version counter increments, by namespace",
        ),
        &["namespace"],
    )
    .expect("metric creation failed")
});

pub static CLUSTER_TASKS_ENQUEUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_cluster_tasks_enqueued_total",
            "Cluster task upserts, by role and task kind",
        ),
        &["role", "kind"],
    )
    .expect("metric creation failed")
});
