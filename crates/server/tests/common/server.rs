//! Server test utilities.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use meridian_core::config::{AdminConfig, AppConfig, MetadataConfig};
use meridian_metadata::{MetadataStore, SqliteStore};
use meridian_server::auth::{NODE_ID_HEADER, NODE_SECRET_HEADER};
use meridian_server::leader::StaticLeadership;
use meridian_server::{AppState, create_router};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// Raw token matching `AdminConfig::for_testing()`.
#[allow(dead_code)]
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Credentials a node authenticates with.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct NodeCredentials {
    pub node_id: i64,
    pub unique_id: String,
    pub secret: String,
}

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub leader: Arc<StaticLeadership>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new primary test server backed by a temporary SQLite file.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        config.admin = AdminConfig::for_testing();
        modifier(&mut config);

        meridian_server::bootstrap::ensure_admin_token(metadata.as_ref(), &config.admin)
            .await
            .expect("Failed to create admin token");

        let leader = Arc::new(StaticLeadership::new(true));
        let state = AppState::new(config, metadata, leader.clone());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            leader,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Send a request and decode the JSON response body (`Null` when empty).
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        let json = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// JSON request with an optional bearer token.
    pub async fn json_request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        auth_token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = auth_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    /// Request authenticated with the bootstrap admin token.
    pub async fn admin(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.json_request(method, uri, body, Some(ADMIN_TOKEN)).await
    }

    /// Request authenticated as a node.
    pub async fn node(
        &self,
        creds: &NodeCredentials,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(NODE_ID_HEADER, &creds.unique_id)
            .header(NODE_SECRET_HEADER, &creds.secret);
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    /// Create a cluster through the admin API and return its id.
    pub async fn create_cluster(&self, name: &str, role: &str) -> i64 {
        let (status, body) = self
            .admin(
                "POST",
                "/v1/admin/clusters",
                Some(serde_json::json!({ "name": name, "role": role })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create cluster: {body}");
        body["id"].as_i64().unwrap()
    }

    /// Create a node through the admin API and return its credentials.
    pub async fn create_node(&self, cluster_id: i64, name: &str) -> NodeCredentials {
        let (status, body) = self
            .admin(
                "POST",
                &format!("/v1/admin/clusters/{cluster_id}/nodes"),
                Some(serde_json::json!({ "name": name })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create node: {body}");
        NodeCredentials {
            node_id: body["node"]["id"].as_i64().unwrap(),
            unique_id: body["node"]["unique_id"].as_str().unwrap().to_string(),
            secret: body["secret"].as_str().unwrap().to_string(),
        }
    }
}
