//! PostgreSQL integration tests using testcontainers.
//!
//! These exercise concurrent access that SQLite serializes away. They
//! require Docker to be running. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use common::{POSTGRES_CONTAINER_START_ERR_PREFIX, PostgresTestMetadata, seed_cluster, seed_node};
use meridian_core::{EntityKind, NodeRole, TaskKind};
use meridian_metadata::models::DnsRecordFields;
use std::collections::HashSet;
use time::{Duration, OffsetDateTime};

/// Try to create a PostgreSQL test store, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures (Docker unavailable) cause a skip.
/// Schema, migration, or connection errors still panic so real regressions
/// are not silently swallowed.
async fn postgres_or_skip() -> Option<PostgresTestMetadata> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestMetadata::new().await {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

#[tokio::test]
async fn test_postgres_concurrent_version_bumps_are_unique() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let store = metadata.store();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.increase_version("PG_TEST_NS").await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        assert!(seen.insert(handle.await.unwrap()));
    }
    assert_eq!(seen.len(), 50);
    assert_eq!(seen.iter().copied().max(), Some(50));
    assert_eq!(store.current_version("PG_TEST_NS").await.unwrap(), 50);
}

#[tokio::test]
async fn test_postgres_concurrent_mutations_keep_versions_visible_in_order() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let store = metadata.store();
    let cluster = seed_cluster(store.as_ref(), "dns", NodeRole::Dns, None).await;
    let domain = store.create_domain(cluster.id, "example.com").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        let domain_id = domain.id;
        handles.push(tokio::spawn(async move {
            store
                .create_record(
                    domain_id,
                    &DnsRecordFields {
                        name: format!("host-{i}"),
                        record_type: "A".to_string(),
                        value: format!("10.0.0.{i}"),
                        ttl: 60,
                        route: None,
                    },
                )
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Paging by checkpoint sees every row exactly once.
    let mut checkpoint = 0;
    let mut seen = HashSet::new();
    loop {
        let rows = store
            .list_after_version(EntityKind::Record, cluster.id, checkpoint, 7)
            .await
            .unwrap();
        if rows.is_empty() {
            break;
        }
        for row in &rows {
            assert!(row.version > checkpoint);
            assert!(seen.insert(row.id));
        }
        checkpoint = rows.iter().map(|r| r.version).max().unwrap();
    }
    assert_eq!(seen.len(), 20);
    assert_eq!(checkpoint, 20);
}

#[tokio::test]
async fn test_postgres_concurrent_claimers_never_share_a_task() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let store = metadata.store();

    for i in 0..10 {
        let cluster = seed_cluster(store.as_ref(), &format!("edge-{i}"), NodeRole::Node, None).await;
        seed_node(store.as_ref(), cluster.id, "a").await;
        store
            .enqueue_cluster_task(NodeRole::Node, cluster.id, 0, TaskKind::ConfigChanged)
            .await
            .unwrap();
    }

    let now = OffsetDateTime::now_utc();
    let mut handles = Vec::new();
    for claimer in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_cluster_tasks(
                    NodeRole::Node,
                    &format!("extractor-{claimer}"),
                    now,
                    now - Duration::minutes(5),
                    10,
                )
                .await
                .unwrap()
        }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        for task in handle.await.unwrap() {
            assert!(claimed.insert(task.id), "task {} claimed twice", task.id);
        }
    }
    assert_eq!(claimed.len(), 10);
}

#[tokio::test]
async fn test_postgres_lease_has_one_holder() {
    let Some(metadata) = postgres_or_skip().await else {
        return;
    };
    let store = metadata.store();
    let now = OffsetDateTime::now_utc();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .try_acquire_lease(&format!("instance-{i}"), now, now + Duration::seconds(30))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(store.current_leader(now).await.unwrap().is_some());
}
