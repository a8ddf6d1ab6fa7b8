//! Cluster, node and node command endpoints.

use super::common::{format_time, format_time_opt, generate_secret, read_json};
use crate::auth::require_auth;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use meridian_core::token::TokenScope;
use meridian_core::{HealthCheckPolicy, NodeRole};
use meridian_metadata::models::{
    ClusterRow, ClusterUpdate, NewCluster, NewNode, NewNodeIpAddress, NodeIpAddressRow, NodeRow,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Upper bound for a synchronous node command.
const MAX_COMMAND_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// Clusters
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub health_check: Option<HealthCheckPolicy>,
    #[serde(default)]
    pub auto_remote_start: bool,
}

/// Absent leaves the field alone, `null` clears it.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateClusterRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub health_check: Option<Option<HealthCheckPolicy>>,
    #[serde(default)]
    pub auto_remote_start: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterQuery {
    pub role: Option<String>,
    #[serde(default)]
    pub include_disabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub id: i64,
    pub name: String,
    pub role: String,
    pub state: String,
    pub health_check: Option<HealthCheckPolicy>,
    pub auto_remote_start: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ClusterResponse {
    fn from_row(row: ClusterRow) -> ApiResult<Self> {
        Ok(Self {
            health_check: row.health_check_policy(),
            id: row.id,
            name: row.name,
            role: row.role,
            state: row.state,
            auto_remote_start: row.auto_remote_start,
            created_at: format_time(row.created_at)?,
            updated_at: format_time(row.updated_at)?,
        })
    }
}

fn validate_policy(policy: Option<&HealthCheckPolicy>) -> ApiResult<()> {
    if let Some(policy) = policy {
        policy
            .validate()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    Ok(())
}

async fn load_cluster(state: &AppState, cluster_id: i64) -> ApiResult<ClusterRow> {
    state
        .metadata
        .get_cluster(cluster_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cluster {cluster_id} not found")))
}

/// POST /v1/admin/clusters
pub async fn create_cluster(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<ClusterResponse>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: CreateClusterRequest = read_json(req).await?;

    let role = NodeRole::parse(&body.role)?;
    validate_policy(body.health_check.as_ref())?;

    let row = state
        .metadata
        .create_cluster(&NewCluster {
            name: body.name,
            role,
            health_check: body.health_check,
            auto_remote_start: body.auto_remote_start,
        })
        .await?;
    tracing::info!(cluster_id = row.id, role = %role, "Cluster created");

    Ok((StatusCode::CREATED, Json(ClusterResponse::from_row(row)?)))
}

/// GET /v1/admin/clusters
pub async fn list_clusters(
    State(state): State<AppState>,
    Query(query): Query<ClusterQuery>,
    req: Request,
) -> ApiResult<Json<Vec<ClusterResponse>>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;

    let role = query.role.as_deref().map(NodeRole::parse).transpose()?;
    let clusters = state
        .metadata
        .list_clusters(role, !query.include_disabled)
        .await?
        .into_iter()
        .map(ClusterResponse::from_row)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(clusters))
}

/// GET /v1/admin/clusters/{cluster_id}
pub async fn get_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<ClusterResponse>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;
    let row = load_cluster(&state, cluster_id).await?;
    Ok(Json(ClusterResponse::from_row(row)?))
}

/// PUT /v1/admin/clusters/{cluster_id}
pub async fn update_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<ClusterResponse>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: UpdateClusterRequest = read_json(req).await?;

    if let Some(Some(policy)) = &body.health_check {
        validate_policy(Some(policy))?;
    }

    let row = state
        .metadata
        .update_cluster(
            cluster_id,
            &ClusterUpdate {
                name: body.name,
                health_check: body.health_check,
                auto_remote_start: body.auto_remote_start,
            },
        )
        .await?;
    Ok(Json(ClusterResponse::from_row(row)?))
}

/// DELETE /v1/admin/clusters/{cluster_id} - Disable a cluster.
pub async fn delete_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    req: Request,
) -> ApiResult<StatusCode> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    state.metadata.disable_cluster(cluster_id).await?;
    tracing::info!(cluster_id, "Cluster disabled");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
}

/// Node with its credentials. Only returned on creation.
#[derive(Debug, Serialize)]
pub struct CreateNodeResponse {
    pub node: NodeResponse,
    pub secret: String,
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: i64,
    pub cluster_id: i64,
    pub unique_id: String,
    pub name: String,
    pub is_on: bool,
    pub is_active: bool,
    pub is_up: bool,
    pub is_connected: bool,
    pub status: Option<serde_json::Value>,
    pub last_seen_at: Option<String>,
    pub version: i64,
    pub state: String,
    pub created_at: String,
}

impl NodeResponse {
    fn from_row(row: NodeRow, is_connected: bool) -> ApiResult<Self> {
        let status = row
            .status_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());
        Ok(Self {
            id: row.id,
            cluster_id: row.cluster_id,
            unique_id: row.unique_id,
            name: row.name,
            is_on: row.is_on,
            is_active: row.is_active,
            is_up: row.is_up,
            is_connected,
            status,
            last_seen_at: format_time_opt(row.last_seen_at)?,
            version: row.version,
            state: row.state,
            created_at: format_time(row.created_at)?,
        })
    }
}

async fn load_node(state: &AppState, node_id: i64) -> ApiResult<NodeRow> {
    state
        .metadata
        .get_node(node_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("node {node_id} not found")))
}

/// POST /v1/admin/clusters/{cluster_id}/nodes
pub async fn create_node(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    req: Request,
) -> ApiResult<(StatusCode, Json<CreateNodeResponse>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: CreateNodeRequest = read_json(req).await?;

    let secret = generate_secret();
    let row = state
        .metadata
        .create_node(&NewNode {
            cluster_id,
            name: body.name,
            unique_id: uuid::Uuid::new_v4().simple().to_string(),
            secret: secret.clone(),
        })
        .await?;
    tracing::info!(cluster_id, node_id = row.id, "Node created");

    Ok((
        StatusCode::CREATED,
        Json(CreateNodeResponse {
            node: NodeResponse::from_row(row, false)?,
            secret,
        }),
    ))
}

/// GET /v1/admin/clusters/{cluster_id}/nodes
pub async fn list_nodes(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<Vec<NodeResponse>>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;
    load_cluster(&state, cluster_id).await?;

    let mut nodes = Vec::new();
    for row in state.metadata.list_nodes(cluster_id).await? {
        let connected = state.hub.is_connected(row.id).await;
        nodes.push(NodeResponse::from_row(row, connected)?);
    }
    Ok(Json(nodes))
}

/// GET /v1/admin/nodes/{node_id}
pub async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<NodeResponse>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;
    let row = load_node(&state, node_id).await?;
    let connected = state.hub.is_connected(node_id).await;
    Ok(Json(NodeResponse::from_row(row, connected)?))
}

/// DELETE /v1/admin/nodes/{node_id} - Tombstone a node.
pub async fn delete_node(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;

    let version = state.metadata.disable_node(node_id).await?;
    state.metadata.delete_tasks_for_node(node_id).await?;
    tracing::info!(node_id, version, "Node disabled");

    Ok(Json(serde_json::json!({ "id": node_id, "version": version })))
}

// =============================================================================
// Node IP addresses
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AddIpRequest {
    pub ip: String,
    #[serde(default = "default_can_access")]
    pub can_access: bool,
    #[serde(default)]
    pub sort_order: i64,
}

fn default_can_access() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct IpAddressResponse {
    pub id: i64,
    pub node_id: i64,
    pub ip: String,
    pub is_on: bool,
    pub can_access: bool,
    pub is_up: bool,
    pub sort_order: i64,
}

impl From<NodeIpAddressRow> for IpAddressResponse {
    fn from(row: NodeIpAddressRow) -> Self {
        Self {
            id: row.id,
            node_id: row.node_id,
            ip: row.ip,
            is_on: row.is_on,
            can_access: row.can_access,
            is_up: row.is_up,
            sort_order: row.sort_order,
        }
    }
}

/// POST /v1/admin/nodes/{node_id}/ips
pub async fn add_ip_address(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    req: Request,
) -> ApiResult<(StatusCode, Json<IpAddressResponse>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: AddIpRequest = read_json(req).await?;

    let node = load_node(&state, node_id).await?;
    if !node.is_enabled() {
        return Err(ApiError::Conflict(format!("node {node_id} is disabled")));
    }

    let row = state
        .metadata
        .add_ip_address(&NewNodeIpAddress {
            node_id,
            ip: body.ip,
            can_access: body.can_access,
            sort_order: body.sort_order,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(row.into())))
}

/// GET /v1/admin/nodes/{node_id}/ips
pub async fn list_ip_addresses(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<Vec<IpAddressResponse>>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;
    load_node(&state, node_id).await?;

    let rows = state.metadata.list_ip_addresses(node_id).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

// =============================================================================
// Node commands
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SendCommandRequest {
    pub code: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SendCommandResponse {
    pub request_id: i64,
    pub is_ok: bool,
    pub message: String,
    pub data: serde_json::Value,
}

/// POST /v1/admin/nodes/{node_id}/commands - Ask a connected node and wait.
pub async fn send_command(
    State(state): State<AppState>,
    Path(node_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<SendCommandResponse>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: SendCommandRequest = read_json(req).await?;

    if body.code.is_empty() {
        return Err(ApiError::BadRequest("command code is required".to_string()));
    }
    load_node(&state, node_id).await?;

    let timeout = body
        .timeout_secs
        .map(|secs| Duration::from_secs(secs.clamp(1, MAX_COMMAND_TIMEOUT_SECS)))
        .unwrap_or_else(|| state.config.command_stream.request_timeout());

    let response = state
        .hub
        .send_command(node_id, &body.code, &body.data, timeout)
        .await?;
    let data = response.data().unwrap_or(serde_json::Value::Null);

    Ok(Json(SendCommandResponse {
        request_id: response.request_id,
        is_ok: response.is_ok,
        message: response.message,
        data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_distinguishes_absent_and_null_policy() {
        let absent: UpdateClusterRequest = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert!(absent.health_check.is_none());

        let cleared: UpdateClusterRequest =
            serde_json::from_str(r#"{"health_check":null}"#).unwrap();
        assert_eq!(cleared.health_check, Some(None));

        let set: UpdateClusterRequest =
            serde_json::from_str(r#"{"health_check":{"path":"/ping"}}"#).unwrap();
        assert_eq!(set.health_check.unwrap().unwrap().path, "/ping");
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let policy = HealthCheckPolicy {
            status_codes: vec![999],
            ..Default::default()
        };
        assert!(matches!(
            validate_policy(Some(&policy)),
            Err(ApiError::BadRequest(_))
        ));
        assert!(validate_policy(None).is_ok());
    }
}
