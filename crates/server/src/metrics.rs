//! Prometheus metrics for the Meridian control plane.
//!
//! Covers the change pipeline (versions, cluster tasks, node tasks), pull
//! traffic, liveness probing and the command stream.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Labels carry entity kinds and outcomes only, never node ids or secrets.
//! Restrict the endpoint to the scraper at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{self, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Change pipeline. The version and enqueue counters live next to the
// notifier that bumps them.
pub use meridian_metadata::metrics::{CLUSTER_TASKS_ENQUEUED, VERSION_INCREMENTS};

pub static CLUSTER_TASKS_EXTRACTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_cluster_tasks_extracted_total",
            "Cluster tasks fanned out into node tasks, by role",
        ),
        &["role"],
    )
    .expect("metric creation failed")
});

pub static CLUSTER_TASKS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_cluster_tasks_failed_total",
            "Cluster task fan-outs that failed and were released, by role",
        ),
        &["role"],
    )
    .expect("metric creation failed")
});

pub static NODE_TASKS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "meridian_node_tasks_created_total",
        "Node tasks created or refreshed by fan-out",
    )
    .expect("metric creation failed")
});

// Pull API
pub static SYNC_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_sync_requests_total",
            "ListAfterVersion requests, by entity kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static SYNC_ROWS_SERVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_sync_rows_served_total",
            "Rows returned by ListAfterVersion, by entity kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

// Liveness
pub static HEALTH_PROBES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_health_probes_total",
            "Active health probes, by outcome (ok, failed)",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static NODE_STATE_FLIPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_node_state_flips_total",
            "Debounced node up/down transitions, by direction",
        ),
        &["direction"],
    )
    .expect("metric creation failed")
});

pub static INACTIVITY_NOTIFICATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "meridian_inactivity_notifications_total",
        "NodeInactive messages written",
    )
    .expect("metric creation failed")
});

pub static REMOTE_START_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_remote_start_attempts_total",
            "Remote start attempts for inactive nodes, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

// Command stream
pub static COMMANDS_SENT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_commands_sent_total",
            "Messages queued to node streams, by code",
        ),
        &["code"],
    )
    .expect("metric creation failed")
});

pub static COMMANDS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "meridian_commands_dropped_total",
        "Messages dropped because the node's queue was full",
    )
    .expect("metric creation failed")
});

pub static COMMANDS_TIMED_OUT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "meridian_commands_timed_out_total",
        "Commands whose caller gave up waiting for a response",
    )
    .expect("metric creation failed")
});

pub static COMMAND_WAITERS_SWEPT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "meridian_command_waiters_swept_total",
        "Stale response waiters removed by the sweeper",
    )
    .expect("metric creation failed")
});

pub static CONNECTED_STREAMS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "meridian_connected_streams",
        "Nodes with an open command stream",
    )
    .expect("metric creation failed")
});

// Background loops
pub static LOOP_TICK_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "meridian_loop_tick_failures_total",
            "Background loop ticks that failed or panicked, by loop",
        ),
        &["loop"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests and embedded routers may call it repeatedly.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(VERSION_INCREMENTS.clone()),
            Box::new(CLUSTER_TASKS_ENQUEUED.clone()),
            Box::new(CLUSTER_TASKS_EXTRACTED.clone()),
            Box::new(CLUSTER_TASKS_FAILED.clone()),
            Box::new(NODE_TASKS_CREATED.clone()),
            Box::new(SYNC_REQUESTS.clone()),
            Box::new(SYNC_ROWS_SERVED.clone()),
            Box::new(HEALTH_PROBES.clone()),
            Box::new(NODE_STATE_FLIPS.clone()),
            Box::new(INACTIVITY_NOTIFICATIONS.clone()),
            Box::new(REMOTE_START_ATTEMPTS.clone()),
            Box::new(COMMANDS_SENT.clone()),
            Box::new(COMMANDS_DROPPED.clone()),
            Box::new(COMMANDS_TIMED_OUT.clone()),
            Box::new(COMMAND_WAITERS_SWEPT.clone()),
            Box::new(CONNECTED_STREAMS.clone()),
            Box::new(LOOP_TICK_FAILURES.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record a debounced node flip.
pub fn record_flip(is_up: bool) {
    let direction = if is_up { "up" } else { "down" };
    NODE_STATE_FLIPS.with_label_values(&[direction]).inc();
}

/// Record a failed or panicked tick of a background loop.
pub fn record_tick_failure(loop_name: &str) {
    LOOP_TICK_FAILURES.with_label_values(&[loop_name]).inc();
}
