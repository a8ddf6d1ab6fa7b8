//! Integration tests for active health checks against a mock node endpoint.

mod common;

use common::{TestMetadata, seed_cluster, seed_ip, seed_node};
use httpmock::Method::GET;
use httpmock::MockServer;
use meridian_core::config::HealthCheckConfig;
use meridian_core::{HealthCheckPolicy, NodeRole};
use meridian_metadata::MetadataStore;
use meridian_metadata::models::MessageFilter;
use meridian_server::leader::StaticLeadership;
use meridian_server::liveness::health_check::HEALTH_CHECK_HEADER;
use meridian_server::liveness::{HealthCheckExecutor, HealthCheckScheduler};
use std::net::TcpListener;
use std::sync::Arc;

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn quick_policy() -> HealthCheckPolicy {
    HealthCheckPolicy {
        path: "/health".to_string(),
        timeout_secs: 2,
        tries: 1,
        try_delay_ms: 0,
        count_up: 1,
        count_down: 1,
        ..Default::default()
    }
}

fn executor(store: Arc<dyn MetadataStore>, workers: usize) -> HealthCheckExecutor {
    let config = HealthCheckConfig {
        workers,
        ..Default::default()
    };
    HealthCheckExecutor::new(store, &config).unwrap()
}

async fn failure_messages(store: &dyn MetadataStore, cluster_id: i64) -> usize {
    store
        .list_messages(&MessageFilter {
            cluster_id: Some(cluster_id),
            ..Default::default()
        })
        .await
        .unwrap()
        .iter()
        .filter(|m| m.kind == "HealthCheckFailed")
        .count()
}

#[tokio::test]
async fn test_pool_probes_every_node_once() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/health")
                .header_exists(HEALTH_CHECK_HEADER);
            then.status(200);
        })
        .await;

    let test_metadata = TestMetadata::new().await.unwrap();
    let store = test_metadata.store();
    let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, Some(quick_policy())).await;

    let mut failing = Vec::new();
    for i in 0..25 {
        let node = seed_node(store.as_ref(), cluster.id, &format!("edge-{i}")).await;
        if i % 5 == 0 {
            // Nothing listens on port 1.
            seed_ip(store.as_ref(), node.id, "127.0.0.1:1").await;
            failing.push(node.id);
        } else {
            seed_ip(store.as_ref(), node.id, &format!("127.0.0.1:{}", server.port())).await;
        }
    }

    let results = executor(store.clone(), 10).run(cluster.id).await.unwrap();
    assert_eq!(results.len(), 25);
    assert!(results.windows(2).all(|w| w[0].node_id < w[1].node_id));
    assert_eq!(results.iter().filter(|r| r.ok).count(), 20);
    assert_eq!(mock.hits_async().await, 20);

    for result in &results {
        assert_eq!(result.tries, 1);
        assert_eq!(result.ok, !failing.contains(&result.node_id));
        let node = store.get_node(result.node_id).await.unwrap().unwrap();
        assert_eq!(node.is_up, result.ok);
    }
    assert_eq!(failure_messages(store.as_ref(), cluster.id).await, 5);
}

#[tokio::test]
async fn test_debounce_requires_consecutive_failures() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        })
        .await;

    let test_metadata = TestMetadata::new().await.unwrap();
    let store = test_metadata.store();
    let policy = HealthCheckPolicy {
        count_down: 3,
        ..quick_policy()
    };
    let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, Some(policy)).await;
    let node = seed_node(store.as_ref(), cluster.id, "edge-1").await;
    seed_ip(store.as_ref(), node.id, &format!("127.0.0.1:{}", server.port())).await;

    let executor = executor(store.clone(), 2);
    for round in 1..=3 {
        let results = executor.run(cluster.id).await.unwrap();
        assert!(!results[0].ok);
        assert_eq!(results[0].status, Some(503));

        let row = store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(row.count_down, round);
        assert_eq!(row.is_up, round < 3, "round {round}");
    }
    assert_eq!(failure_messages(store.as_ref(), cluster.id).await, 1);

    // Creation, the address and the flip each bumped the node version.
    let delta = store
        .get_entity(meridian_core::EntityKind::Node, node.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delta.version, 3);
    assert_eq!(delta.data["is_up"], false);
}

#[tokio::test]
async fn test_configured_status_codes_and_retries() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200);
        })
        .await;

    let test_metadata = TestMetadata::new().await.unwrap();
    let store = test_metadata.store();
    let policy = HealthCheckPolicy {
        status_codes: vec![204],
        tries: 3,
        ..quick_policy()
    };
    let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, Some(policy)).await;
    let node = seed_node(store.as_ref(), cluster.id, "edge-1").await;
    seed_ip(store.as_ref(), node.id, &format!("127.0.0.1:{}", server.port())).await;

    let results = executor(store.clone(), 1).run(cluster.id).await.unwrap();
    assert!(!results[0].ok);
    assert_eq!(results[0].tries, 3);
    assert_eq!(results[0].error.as_deref(), Some("unexpected status 200"));
    assert_eq!(mock.hits_async().await, 3);
}

#[tokio::test]
async fn test_node_without_address_fails() {
    let test_metadata = TestMetadata::new().await.unwrap();
    let store = test_metadata.store();
    let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, Some(quick_policy())).await;
    let node = seed_node(store.as_ref(), cluster.id, "edge-1").await;

    let results = executor(store.clone(), 4).run(cluster.id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].node_id, node.id);
    assert!(!results[0].ok);
    assert_eq!(results[0].tries, 0);
    assert_eq!(results[0].error.as_deref(), Some("no accessible ip"));
}

#[tokio::test]
async fn test_ip_health_is_tracked_when_enabled() {
    let test_metadata = TestMetadata::new().await.unwrap();
    let store = test_metadata.store();
    let policy = HealthCheckPolicy {
        track_ip_health: true,
        ..quick_policy()
    };
    let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, Some(policy)).await;
    let node = seed_node(store.as_ref(), cluster.id, "edge-1").await;
    let address_id = seed_ip(store.as_ref(), node.id, "127.0.0.1:1").await;

    executor(store.clone(), 1).run(cluster.id).await.unwrap();

    let addresses = store.list_ip_addresses(node.id).await.unwrap();
    let address = addresses.iter().find(|a| a.id == address_id).unwrap();
    assert!(!address.is_up);

    let kinds: Vec<String> = store
        .list_messages(&MessageFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.kind)
        .collect();
    assert!(kinds.contains(&"IpAddressDown".to_string()));
    assert!(kinds.contains(&"HealthCheckFailed".to_string()));
}

#[tokio::test]
async fn test_scheduler_runs_only_on_primary() {
    let test_metadata = TestMetadata::new().await.unwrap();
    let store = test_metadata.store();
    let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, Some(quick_policy())).await;
    seed_node(store.as_ref(), cluster.id, "edge-1").await;
    let disabled_policy = HealthCheckPolicy {
        enabled: false,
        ..quick_policy()
    };
    seed_cluster(store.as_ref(), "quiet", NodeRole::Node, Some(disabled_policy)).await;

    let leader = Arc::new(StaticLeadership::new(false));
    let scheduler = HealthCheckScheduler::new(
        Arc::new(executor(store.clone(), 2)),
        store.clone(),
        leader.clone(),
    );

    assert_eq!(scheduler.tick().await.unwrap(), 0);
    assert_eq!(failure_messages(store.as_ref(), cluster.id).await, 0);

    leader.set_primary(true);
    assert_eq!(scheduler.tick().await.unwrap(), 1);
    assert_eq!(failure_messages(store.as_ref(), cluster.id).await, 1);
}
