//! Metadata store tests, run against SQLite and (when Docker is available)
//! PostgreSQL.

mod common;

use common::{run_metadata_test_both, seed_cluster, seed_ip, seed_node};
use meridian_core::{EntityKind, NodeRole, TaskAck, TaskKind, Thresholds};
use meridian_metadata::MetadataError;
use meridian_metadata::models::{DnsRecordFields, MessageFilter, NewMessage};
use time::{Duration, OffsetDateTime};

fn record(name: &str, value: &str) -> DnsRecordFields {
    DnsRecordFields {
        name: name.to_string(),
        record_type: "A".to_string(),
        value: value.to_string(),
        ttl: 300,
        route: None,
    }
}

#[tokio::test]
async fn test_version_counter() {
    run_metadata_test_both(|store| async move {
        assert_eq!(store.current_version("TEST_NS").await.unwrap(), 0);
        assert_eq!(store.increase_version("TEST_NS").await.unwrap(), 1);
        assert_eq!(store.increase_version("TEST_NS").await.unwrap(), 2);
        assert_eq!(store.increase_version("OTHER_NS").await.unwrap(), 1);
        assert_eq!(store.current_version("TEST_NS").await.unwrap(), 2);
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_increases_never_repeat() {
    run_metadata_test_both(|store| async move {
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increase_version("CONCURRENT_NS").await })
            })
            .collect();

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap());
        }
        values.sort_unstable();
        assert_eq!(values, (1..=32).collect::<Vec<i64>>());
        assert_eq!(store.current_version("CONCURRENT_NS").await.unwrap(), 32);
    })
    .await;
}

#[tokio::test]
async fn test_list_after_version_is_repeatable() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "dns", NodeRole::Dns, None).await;
        let domain = store.create_domain(cluster.id, "example.com").await.unwrap();
        for value in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            store
                .create_record(domain.id, &record("www", value))
                .await
                .unwrap();
        }
        let first = store
            .list_after_version(EntityKind::Record, cluster.id, 0, 2)
            .await
            .unwrap();
        store.disable_entity(EntityKind::Record, first[0].id).await.unwrap();

        let once = store
            .list_after_version(EntityKind::Record, cluster.id, 1, 10)
            .await
            .unwrap();
        let twice = store
            .list_after_version(EntityKind::Record, cluster.id, 1, 10)
            .await
            .unwrap();
        assert_eq!(once, twice);
        assert!(once.iter().any(|row| row.is_deleted));
    })
    .await;
}

#[tokio::test]
async fn test_notifier_counts_every_change() {
    use meridian_metadata::metrics::{CLUSTER_TASKS_ENQUEUED, VERSION_INCREMENTS};

    run_metadata_test_both(|store| async move {
        let namespace = EntityKind::Node.namespace();
        let task_kind = EntityKind::Node.task_kind();
        let versions = || VERSION_INCREMENTS.with_label_values(&[namespace]).get();
        let enqueued = || {
            CLUSTER_TASKS_ENQUEUED
                .with_label_values(&[NodeRole::Node.as_str(), task_kind.as_str()])
                .get()
        };

        let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, None).await;
        let node = seed_node(store.as_ref(), cluster.id, "a").await;
        let (versions_before, enqueued_before) = (versions(), enqueued());

        // Neither change goes through an admin handler.
        assert_eq!(
            store
                .update_node_up_count(node.id, false, Thresholds::new(1, 1))
                .await
                .unwrap(),
            Some(false)
        );
        assert!(
            store
                .record_heartbeat(node.id, None, OffsetDateTime::now_utc())
                .await
                .unwrap()
        );

        // Counters are process-wide, so other tests may add to them too.
        assert!(versions() >= versions_before + 2);
        assert!(enqueued() >= enqueued_before + 2);
    })
    .await;
}

#[tokio::test]
async fn test_mutations_stamp_versions_and_enqueue_tasks() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "dns", NodeRole::Dns, None).await;
        let domain = store.create_domain(cluster.id, "example.com").await.unwrap();
        assert_eq!(domain.version, 1);

        let www = store
            .create_record(domain.id, &record("www", "10.0.0.1"))
            .await
            .unwrap();
        let api = store
            .create_record(domain.id, &record("api", "10.0.0.2"))
            .await
            .unwrap();
        let www = store
            .update_record(www.id, &record("www", "10.0.0.3"))
            .await
            .unwrap();
        assert_eq!((api.version, www.version), (2, 3));

        let rows = store
            .list_after_version(EntityKind::Record, cluster.id, 1, 100)
            .await
            .unwrap();
        let versions: Vec<i64> = rows.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(rows[1].data["value"], "10.0.0.3");

        // One coalesced task per (cluster, kind).
        let tasks = store.list_cluster_tasks(Some(NodeRole::Dns)).await.unwrap();
        let record_task = tasks
            .iter()
            .find(|t| t.kind == TaskKind::DnsRecordChanged.as_str())
            .unwrap();
        assert_eq!(record_task.generation, 2);
        assert_eq!(tasks.len(), 2);
    })
    .await;
}

#[tokio::test]
async fn test_tombstones_and_recreation() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "dns", NodeRole::Dns, None).await;
        let domain = store.create_domain(cluster.id, "example.net").await.unwrap();
        let rec = store
            .create_record(domain.id, &record("www", "10.0.0.1"))
            .await
            .unwrap();

        let tombstone = store.disable_entity(EntityKind::Record, rec.id).await.unwrap();
        assert!(tombstone > rec.version);
        assert_eq!(
            store.disable_entity(EntityKind::Record, rec.id).await.unwrap(),
            tombstone
        );

        let delta = store
            .get_entity(EntityKind::Record, rec.id)
            .await
            .unwrap()
            .unwrap();
        assert!(delta.is_deleted);

        let revived = store.recreate_entity(EntityKind::Record, rec.id).await.unwrap();
        assert_ne!(revived, rec.id);
        assert!(matches!(
            store.recreate_entity(EntityKind::Record, revived).await,
            Err(MetadataError::InvalidStateTransition { .. })
        ));

        // Disabling a domain tombstones what hangs off it.
        store.disable_entity(EntityKind::Domain, domain.id).await.unwrap();
        let revived_row = store
            .get_entity(EntityKind::Record, revived)
            .await
            .unwrap()
            .unwrap();
        assert!(revived_row.is_deleted);

        assert_eq!(
            store.recreate_entity(EntityKind::Domain, domain.id).await.unwrap(),
            domain.id
        );
    })
    .await;
}

#[tokio::test]
async fn test_renotify_during_extraction_keeps_task() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, None).await;
        let a = seed_node(store.as_ref(), cluster.id, "a").await;
        let b = seed_node(store.as_ref(), cluster.id, "b").await;

        store
            .enqueue_cluster_task(NodeRole::Node, cluster.id, 0, TaskKind::ConfigChanged)
            .await
            .unwrap();

        let now = OffsetDateTime::now_utc();
        let claimed = store
            .claim_cluster_tasks(NodeRole::Node, "extractor-1", now, now - Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        // A second claimer sees nothing while the claim is fresh.
        let none = store
            .claim_cluster_tasks(NodeRole::Node, "extractor-2", now, now - Duration::minutes(5), 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        store
            .enqueue_cluster_task(NodeRole::Node, cluster.id, 0, TaskKind::ConfigChanged)
            .await
            .unwrap();

        let fan_out = store.fan_out_cluster_task(&claimed[0]).await.unwrap();
        assert_eq!(fan_out.node_ids, vec![a.id, b.id]);
        assert!(!fan_out.completed);

        let pending = store.list_cluster_tasks(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, "pending");

        let reclaimed = store
            .claim_cluster_tasks(NodeRole::Node, "extractor-1", now, now - Duration::minutes(5), 10)
            .await
            .unwrap();
        assert!(store.fan_out_cluster_task(&reclaimed[0]).await.unwrap().completed);
        assert!(store.list_cluster_tasks(None).await.unwrap().is_empty());

        // Node tasks are upserted, not duplicated.
        let tasks = store.list_node_tasks(NodeRole::Node, a.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, "configChanged");
    })
    .await;
}

#[tokio::test]
async fn test_stale_claims_are_reclaimed() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, None).await;
        seed_node(store.as_ref(), cluster.id, "a").await;
        store
            .enqueue_cluster_task(NodeRole::Node, cluster.id, 0, TaskKind::NodeStatusChanged)
            .await
            .unwrap();

        let t0 = OffsetDateTime::now_utc() - Duration::minutes(10);
        let first = store
            .claim_cluster_tasks(NodeRole::Node, "crashed", t0, t0 - Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let now = OffsetDateTime::now_utc();
        let second = store
            .claim_cluster_tasks(NodeRole::Node, "survivor", now, now - Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].claimed_by.as_deref(), Some("survivor"));

        store.release_cluster_task(second[0].id).await.unwrap();
        let tasks = store.list_cluster_tasks(None).await.unwrap();
        assert_eq!(tasks[0].state, "pending");
        assert!(tasks[0].claimed_by.is_none());
    })
    .await;
}

#[tokio::test]
async fn test_node_tasks_are_scoped_to_node() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, None).await;
        let a = seed_node(store.as_ref(), cluster.id, "a").await;
        let b = seed_node(store.as_ref(), cluster.id, "b").await;
        store
            .enqueue_cluster_task(NodeRole::Node, cluster.id, 0, TaskKind::ConfigChanged)
            .await
            .unwrap();
        let now = OffsetDateTime::now_utc();
        for task in store
            .claim_cluster_tasks(NodeRole::Node, "x", now, now - Duration::minutes(5), 10)
            .await
            .unwrap()
        {
            store.fan_out_cluster_task(&task).await.unwrap();
        }

        let b_task = &store.list_node_tasks(NodeRole::Node, b.id).await.unwrap()[0];
        let ack = TaskAck {
            id: b_task.id,
            version: b_task.version,
        };
        // a cannot delete b's task.
        assert_eq!(store.delete_node_tasks(a.id, &[ack]).await.unwrap(), 0);
        assert_eq!(store.delete_node_tasks(b.id, &[ack]).await.unwrap(), 1);

        assert_eq!(store.delete_tasks_for_node(a.id).await.unwrap(), 1);
        assert!(store.list_node_tasks(NodeRole::Node, a.id).await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_refreshed_node_task_survives_stale_ack() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, None).await;
        let node = seed_node(store.as_ref(), cluster.id, "a").await;
        let fan_out_all = || {
            let store = store.clone();
            async move {
                let now = OffsetDateTime::now_utc();
                for task in store
                    .claim_cluster_tasks(NodeRole::Node, "x", now, now - Duration::minutes(5), 10)
                    .await
                    .unwrap()
                {
                    store.fan_out_cluster_task(&task).await.unwrap();
                }
            }
        };

        store
            .enqueue_cluster_task(NodeRole::Node, cluster.id, 0, TaskKind::ConfigChanged)
            .await
            .unwrap();
        fan_out_all().await;
        let seen = store
            .list_node_tasks(NodeRole::Node, node.id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.kind == "configChanged")
            .unwrap();

        // configChanged has no namespace, yet the refresh still moves the row.
        store
            .enqueue_cluster_task(NodeRole::Node, cluster.id, 0, TaskKind::ConfigChanged)
            .await
            .unwrap();
        fan_out_all().await;

        let stale = TaskAck {
            id: seen.id,
            version: seen.version,
        };
        assert_eq!(store.delete_node_tasks(node.id, &[stale]).await.unwrap(), 0);
        let refreshed = store
            .list_node_tasks(NodeRole::Node, node.id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.kind == "configChanged")
            .unwrap();
        assert_eq!(refreshed.id, seen.id);
        assert!(refreshed.version > seen.version);

        let current = TaskAck {
            id: refreshed.id,
            version: refreshed.version,
        };
        assert_eq!(store.delete_node_tasks(node.id, &[current]).await.unwrap(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_heartbeat_and_activity() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, None).await;
        let node = seed_node(store.as_ref(), cluster.id, "a").await;
        assert!(!node.is_active);

        let now = OffsetDateTime::now_utc();
        assert!(
            store
                .record_heartbeat(node.id, Some(r#"{"load":1}"#), now)
                .await
                .unwrap()
        );
        assert!(!store.record_heartbeat(node.id, None, now).await.unwrap());

        let row = store.get_node(node.id).await.unwrap().unwrap();
        assert!(row.is_active);
        assert_eq!(row.status_json.as_deref(), Some(r#"{"load":1}"#));

        assert!(
            store
                .find_silent_nodes(cluster.id, now - Duration::minutes(1))
                .await
                .unwrap()
                .is_empty()
        );
        let silent = store
            .find_silent_nodes(cluster.id, now + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(silent.len(), 1);

        assert!(store.set_node_active(node.id, false).await.unwrap());
        assert!(!store.set_node_active(node.id, false).await.unwrap());
        store.mark_inactive_notified(node.id, now).await.unwrap();
        assert!(
            store
                .get_node(node.id)
                .await
                .unwrap()
                .unwrap()
                .inactive_notified_at
                .is_some()
        );
    })
    .await;
}

#[tokio::test]
async fn test_up_down_debounce() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, None).await;
        let node = seed_node(store.as_ref(), cluster.id, "a").await;
        let ip = seed_ip(store.as_ref(), node.id, "10.0.0.1").await;
        let thresholds = Thresholds::new(1, 2);

        assert_eq!(store.update_node_up_count(node.id, false, thresholds).await.unwrap(), None);
        assert_eq!(
            store.update_node_up_count(node.id, false, thresholds).await.unwrap(),
            Some(false)
        );
        assert_eq!(
            store.update_node_up_count(node.id, true, thresholds).await.unwrap(),
            Some(true)
        );

        let before = store.get_node(node.id).await.unwrap().unwrap().version;
        store.update_ip_up_count(ip, false, thresholds).await.unwrap();
        assert_eq!(
            store.update_ip_up_count(ip, false, thresholds).await.unwrap(),
            Some(false)
        );
        let after = store.get_node(node.id).await.unwrap().unwrap().version;
        assert!(after > before);
        assert!(!store.list_ip_addresses(node.id).await.unwrap()[0].is_up);
    })
    .await;
}

#[tokio::test]
async fn test_leader_lease() {
    run_metadata_test_both(|store| async move {
        let now = OffsetDateTime::now_utc();
        let ttl = Duration::seconds(30);

        assert!(store.try_acquire_lease("a", now, now + ttl).await.unwrap());
        assert!(!store.try_acquire_lease("b", now, now + ttl).await.unwrap());
        assert!(store.try_acquire_lease("a", now, now + ttl).await.unwrap());
        assert_eq!(store.current_leader(now).await.unwrap().as_deref(), Some("a"));

        let later = now + Duration::minutes(1);
        assert!(store.current_leader(later).await.unwrap().is_none());
        assert!(store.try_acquire_lease("b", later, later + ttl).await.unwrap());
        assert_eq!(store.current_leader(later).await.unwrap().as_deref(), Some("b"));
    })
    .await;
}

#[tokio::test]
async fn test_message_filters() {
    run_metadata_test_both(|store| async move {
        let cluster = seed_cluster(store.as_ref(), "edge", NodeRole::Node, None).await;
        let a = seed_node(store.as_ref(), cluster.id, "a").await;
        let b = seed_node(store.as_ref(), cluster.id, "b").await;

        for node_id in [a.id, b.id, b.id] {
            let kind = meridian_core::MessageKind::HealthCheckFailed;
            store
                .create_message(&NewMessage {
                    role: NodeRole::Node,
                    cluster_id: cluster.id,
                    node_id,
                    kind,
                    level: kind.default_level(),
                    subject: format!("node {node_id}"),
                    body: String::new(),
                })
                .await
                .unwrap();
        }

        let for_b = store
            .list_messages(&MessageFilter {
                node_id: Some(b.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(for_b.len(), 2);
        assert_eq!(for_b[0].level, "error");

        store.mark_message_read(for_b[0].id).await.unwrap();
        let unread = store
            .list_messages(&MessageFilter {
                cluster_id: Some(cluster.id),
                unread_only: true,
                limit: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unread.len(), 2);
    })
    .await;
}
