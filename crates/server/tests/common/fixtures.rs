//! Test fixtures for seeding metadata directly.

use meridian_core::{HealthCheckPolicy, NodeRole};
use meridian_metadata::MetadataStore;
use meridian_metadata::models::{
    ClusterRow, NewCluster, NewNode, NewNodeIpAddress, NodeRow, TokenRow,
};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use uuid::Uuid;

/// Counter for generating unique node ids across a test binary.
static NODE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Compute SHA-256 hash of data as hex string.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

#[allow(dead_code)]
pub async fn seed_cluster(
    store: &dyn MetadataStore,
    name: &str,
    role: NodeRole,
    health_check: Option<HealthCheckPolicy>,
) -> ClusterRow {
    store
        .create_cluster(&NewCluster {
            name: name.to_string(),
            role,
            health_check,
            auto_remote_start: false,
        })
        .await
        .expect("Failed to create cluster")
}

/// Create a node with a unique id and the secret `secret-<unique id>`.
#[allow(dead_code)]
pub async fn seed_node(store: &dyn MetadataStore, cluster_id: i64, name: &str) -> NodeRow {
    let n = NODE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let unique_id = format!("node-{n}-{}", Uuid::new_v4().simple());
    store
        .create_node(&NewNode {
            cluster_id,
            name: name.to_string(),
            secret: format!("secret-{unique_id}"),
            unique_id,
        })
        .await
        .expect("Failed to create node")
}

#[allow(dead_code)]
pub async fn seed_ip(store: &dyn MetadataStore, node_id: i64, ip: &str) -> i64 {
    store
        .add_ip_address(&NewNodeIpAddress {
            node_id,
            ip: ip.to_string(),
            can_access: true,
            sort_order: 0,
        })
        .await
        .expect("Failed to add ip address")
        .id
}

/// Store a token with the given scopes JSON and return the raw secret.
#[allow(dead_code)]
pub async fn seed_token(
    store: &dyn MetadataStore,
    scopes: &str,
    expires_at: Option<OffsetDateTime>,
) -> String {
    let raw_token = format!("test-token-{}", Uuid::new_v4());
    let token = TokenRow {
        token_id: Uuid::new_v4(),
        token_hash: sha256_hash(raw_token.as_bytes()),
        scopes: scopes.to_string(),
        expires_at,
        revoked_at: None,
        created_at: OffsetDateTime::now_utc(),
        last_used_at: None,
        description: Some("Test Token".to_string()),
    };
    store
        .create_token(&token)
        .await
        .expect("Failed to create token");
    raw_token
}
