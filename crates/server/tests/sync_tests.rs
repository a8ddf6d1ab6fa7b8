//! Integration tests for versioned pull sync.

mod common;

use axum::http::StatusCode;
use common::TestServer;
use serde_json::{Value, json};

async fn dns_setup(server: &TestServer) -> (i64, common::NodeCredentials) {
    let cluster_id = server.create_cluster("dns-eu", "dns").await;
    let node = server.create_node(cluster_id, "ns1").await;
    (cluster_id, node)
}

fn versions(body: &Value) -> Vec<i64> {
    body["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["version"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_versions_increase_with_every_mutation() {
    let server = TestServer::new().await;
    let (cluster_id, node) = dns_setup(&server).await;

    let (status, domain) = server
        .admin(
            "POST",
            &format!("/v1/admin/clusters/{cluster_id}/domains"),
            Some(json!({ "name": "example.com" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let domain_id = domain["id"].as_i64().unwrap();
    assert_eq!(domain["version"], 1);

    let mut last = 0;
    for value in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        let (status, record) = server
            .admin(
                "POST",
                &format!("/v1/admin/domains/{domain_id}/records"),
                Some(json!({ "name": "www", "type": "A", "value": value })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let version = record["version"].as_i64().unwrap();
        assert!(version > last);
        last = version;
    }

    let (status, body) = server
        .node(&node, "GET", "/v1/sync/records?version=0", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(versions(&body), vec![1, 2, 3]);
    assert_eq!(body["checkpoint"], 3);

    let (_, body) = server
        .node(&node, "GET", "/v1/sync/records?version=2", None)
        .await;
    assert_eq!(versions(&body), vec![3]);
}

#[tokio::test]
async fn test_pull_includes_tombstones() {
    let server = TestServer::new().await;
    let (cluster_id, node) = dns_setup(&server).await;

    let (_, domain) = server
        .admin(
            "POST",
            &format!("/v1/admin/clusters/{cluster_id}/domains"),
            Some(json!({ "name": "example.org" })),
        )
        .await;
    let domain_id = domain["id"].as_i64().unwrap();
    let (_, record) = server
        .admin(
            "POST",
            &format!("/v1/admin/domains/{domain_id}/records"),
            Some(json!({ "name": "mail", "type": "MX", "value": "mx.example.org", "ttl": 300 })),
        )
        .await;
    let record_id = record["id"].as_i64().unwrap();
    let created_version = record["version"].as_i64().unwrap();

    let (status, tombstone) = server
        .admin(
            "DELETE",
            &format!("/v1/admin/entities/records/{record_id}"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let deleted_version = tombstone["version"].as_i64().unwrap();
    assert!(deleted_version > created_version);

    let (_, body) = server
        .node(
            &node,
            "GET",
            &format!("/v1/sync/records?version={created_version}"),
            None,
        )
        .await;
    let rows = body["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], record_id);
    assert_eq!(rows[0]["is_deleted"], true);
    assert_eq!(body["checkpoint"], deleted_version);

    // Deleting again reports the existing tombstone without a new version.
    let (status, again) = server
        .admin(
            "DELETE",
            &format!("/v1/admin/entities/records/{record_id}"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["version"], deleted_version);
}

#[tokio::test]
async fn test_domain_tombstone_cascades_to_records() {
    let server = TestServer::new().await;
    let (cluster_id, node) = dns_setup(&server).await;

    let (_, domain) = server
        .admin(
            "POST",
            &format!("/v1/admin/clusters/{cluster_id}/domains"),
            Some(json!({ "name": "cascade.test" })),
        )
        .await;
    let domain_id = domain["id"].as_i64().unwrap();
    server
        .admin(
            "POST",
            &format!("/v1/admin/domains/{domain_id}/records"),
            Some(json!({ "name": "@", "type": "A", "value": "192.0.2.1" })),
        )
        .await;

    let (status, _) = server
        .admin(
            "DELETE",
            &format!("/v1/admin/entities/domains/{domain_id}"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = server
        .node(&node, "GET", "/v1/sync/records?version=1", None)
        .await;
    let rows = body["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["is_deleted"], true);
}

#[tokio::test]
async fn test_recreate_record_gets_new_id() {
    let server = TestServer::new().await;
    let (cluster_id, node) = dns_setup(&server).await;

    let (_, domain) = server
        .admin(
            "POST",
            &format!("/v1/admin/clusters/{cluster_id}/domains"),
            Some(json!({ "name": "revive.test" })),
        )
        .await;
    let domain_id = domain["id"].as_i64().unwrap();
    let (_, record) = server
        .admin(
            "POST",
            &format!("/v1/admin/domains/{domain_id}/records"),
            Some(json!({ "name": "api", "type": "CNAME", "value": "lb.revive.test" })),
        )
        .await;
    let record_id = record["id"].as_i64().unwrap();

    // A live row cannot be recreated.
    let (status, _) = server
        .admin(
            "POST",
            &format!("/v1/admin/entities/records/{record_id}/recreate"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    server
        .admin(
            "DELETE",
            &format!("/v1/admin/entities/records/{record_id}"),
            None,
        )
        .await;
    let (status, revived) = server
        .admin(
            "POST",
            &format!("/v1/admin/entities/records/{record_id}/recreate"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(revived["previous_id"], record_id);
    let live_id = revived["id"].as_i64().unwrap();
    assert_ne!(live_id, record_id);

    let (_, body) = server
        .node(&node, "GET", "/v1/sync/records?version=0", None)
        .await;
    let rows = body["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    let last = rows.last().unwrap();
    assert_eq!(last["id"], live_id);
    assert_eq!(last["is_deleted"], false);
    assert_eq!(last["data"]["value"], "lb.revive.test");
}

#[tokio::test]
async fn test_limit_and_checkpoint_paging() {
    let server = TestServer::new().await;
    let (cluster_id, node) = dns_setup(&server).await;

    for i in 0..5 {
        let (status, _) = server
            .admin(
                "POST",
                &format!("/v1/admin/clusters/{cluster_id}/domains"),
                Some(json!({ "name": format!("d{i}.test") })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let mut checkpoint = 0;
    let mut seen = Vec::new();
    loop {
        let (status, body) = server
            .node(
                &node,
                "GET",
                &format!("/v1/sync/domains?version={checkpoint}&limit=2"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let page = versions(&body);
        assert!(page.len() <= 2);
        if page.is_empty() {
            assert_eq!(body["checkpoint"], checkpoint);
            break;
        }
        seen.extend(page);
        checkpoint = body["checkpoint"].as_i64().unwrap();
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_repeated_pull_returns_same_body() {
    let server = TestServer::new().await;
    let (cluster_id, node) = dns_setup(&server).await;

    let mut domain_ids = Vec::new();
    for i in 0..3 {
        let (_, domain) = server
            .admin(
                "POST",
                &format!("/v1/admin/clusters/{cluster_id}/domains"),
                Some(json!({ "name": format!("r{i}.test") })),
            )
            .await;
        domain_ids.push(domain["id"].as_i64().unwrap());
    }
    let (status, _) = server
        .admin(
            "DELETE",
            &format!("/v1/admin/entities/domains/{}", domain_ids[1]),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let uri = "/v1/sync/domains?version=1&limit=10";
    let (status, once) = server.node(&node, "GET", uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, twice) = server.node(&node, "GET", uri, None).await;
    assert_eq!(once, twice);
    assert_eq!(versions(&once), vec![3, 4]);
}

#[tokio::test]
async fn test_rows_of_other_clusters_are_hidden() {
    let server = TestServer::new().await;
    let (cluster_a, node_a) = dns_setup(&server).await;
    let cluster_b = server.create_cluster("dns-us", "dns").await;

    server
        .admin(
            "POST",
            &format!("/v1/admin/clusters/{cluster_a}/domains"),
            Some(json!({ "name": "a.test" })),
        )
        .await;
    server
        .admin(
            "POST",
            &format!("/v1/admin/clusters/{cluster_b}/domains"),
            Some(json!({ "name": "b.test" })),
        )
        .await;

    let (_, body) = server
        .node(&node_a, "GET", "/v1/sync/domains?version=0", None)
        .await;
    let rows = body["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["data"]["name"], "a.test");
}

#[tokio::test]
async fn test_pull_rejects_bad_requests() {
    let server = TestServer::new().await;
    let (_, dns_node) = dns_setup(&server).await;
    let edge_cluster = server.create_cluster("edge", "node").await;
    let edge_node = server.create_node(edge_cluster, "edge-1").await;

    let (status, _) = server
        .node(&dns_node, "GET", "/v1/sync/records?version=-1", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .node(&dns_node, "GET", "/v1/sync/zones?version=0", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // DNS rows are never served to edge nodes.
    let (status, _) = server
        .node(&edge_node, "GET", "/v1/sync/records?version=0", None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = server
        .json_request("GET", "/v1/sync/records?version=0", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let bad = common::NodeCredentials {
        secret: "wrong".to_string(),
        ..dns_node.clone()
    };
    let (status, _) = server
        .node(&bad, "GET", "/v1/sync/records?version=0", None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_nodes_pull_their_cluster_nodes() {
    let server = TestServer::new().await;
    let cluster_id = server.create_cluster("edge", "node").await;
    let first = server.create_node(cluster_id, "edge-1").await;
    let second = server.create_node(cluster_id, "edge-2").await;

    let (status, body) = server
        .node(&first, "GET", "/v1/sync/nodes?version=0", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = body["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![first.node_id, second.node_id]);
    assert!(body["rows"][0]["data"].get("secret").is_none());

    let (status, versions) = server.admin("GET", "/v1/admin/versions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(versions["NODE_VERSION"], 2);
    assert_eq!(versions["NS_RECORD_VERSION"], 0);
}
