//! Administrative endpoints: tokens, messages, the task queue and versions.

use super::common::{format_time, format_time_opt, generate_secret, read_json};
use crate::auth::{hash_token, require_auth};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use meridian_core::token::{CreateTokenRequest, CreateTokenResponse, TokenScope};
use meridian_core::{EntityKind, NodeRole, TaskKind};
use meridian_metadata::models::{ClusterTaskRow, MessageFilter, MessageRow, TokenRow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /v1/health - Health check.
///
/// Intentionally unauthenticated for load balancers and orchestrator probes.
/// Returns only non-sensitive information.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// Tokens
// =============================================================================

/// Token listing response.
#[derive(Debug, Serialize)]
pub struct TokenInfo {
    pub token_id: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<String>,
    pub revoked_at: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub description: Option<String>,
}

impl TokenInfo {
    fn from_row(token: TokenRow) -> ApiResult<Self> {
        let scopes: Vec<String> = serde_json::from_str(&token.scopes)
            .map_err(|e| ApiError::Internal(format!("invalid token scopes: {e}")))?;
        Ok(Self {
            token_id: token.token_id.to_string(),
            scopes,
            expires_at: format_time_opt(token.expires_at)?,
            revoked_at: format_time_opt(token.revoked_at)?,
            created_at: format_time(token.created_at)?,
            last_used_at: format_time_opt(token.last_used_at)?,
            description: token.description,
        })
    }
}

/// POST /v1/admin/tokens - Create a new token.
pub async fn create_token(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<CreateTokenResponse>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: CreateTokenRequest = read_json(req).await?;

    if body.scopes.is_empty() {
        return Err(ApiError::BadRequest("at least one scope is required".to_string()));
    }
    for scope in &body.scopes {
        TokenScope::parse(scope)
            .map_err(|_| ApiError::BadRequest(format!("invalid scope: {scope}")))?;
    }

    let token_secret = generate_secret();
    let token_hash = hash_token(&token_secret);

    let now = OffsetDateTime::now_utc();
    let expires_at = match body.expires_in {
        Some(secs) => {
            let secs_i64: i64 = secs.try_into().map_err(|_| {
                ApiError::BadRequest(format!("expires_in too large: {secs}"))
            })?;
            Some(now + time::Duration::seconds(secs_i64))
        }
        None => None,
    };

    let scopes_json = serde_json::to_string(&body.scopes)
        .map_err(|e| ApiError::Internal(format!("failed to serialize scopes: {e}")))?;

    let token_row = TokenRow {
        token_id: Uuid::new_v4(),
        token_hash,
        scopes: scopes_json,
        expires_at,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: body.description,
    };
    state.metadata.create_token(&token_row).await?;
    tracing::info!(token_id = %token_row.token_id, "Token created");

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token_id: token_row.token_id.to_string(),
            token_secret,
            expires_at: format_time_opt(expires_at)?,
        }),
    ))
}

/// GET /v1/admin/tokens - List tokens.
pub async fn list_tokens(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<Vec<TokenInfo>>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;

    let tokens = state
        .metadata
        .list_tokens()
        .await?
        .into_iter()
        .map(TokenInfo::from_row)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(tokens))
}

/// DELETE /v1/admin/tokens/{token_id} - Revoke a token.
pub async fn revoke_token(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
    req: Request,
) -> ApiResult<StatusCode> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;

    let token_id = Uuid::parse_str(&token_id)
        .map_err(|e| ApiError::BadRequest(format!("invalid token ID: {e}")))?;
    state
        .metadata
        .get_token(token_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("token not found".to_string()))?;

    state
        .metadata
        .revoke_token(token_id, OffsetDateTime::now_utc())
        .await?;
    tracing::info!(token_id = %token_id, "Token revoked");

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct MessageQuery {
    pub cluster_id: Option<i64>,
    pub node_id: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub role: String,
    pub cluster_id: i64,
    pub node_id: i64,
    pub kind: String,
    pub level: String,
    pub subject: String,
    pub body: String,
    pub created_at: String,
    pub is_read: bool,
}

impl MessageResponse {
    fn from_row(row: MessageRow) -> ApiResult<Self> {
        Ok(Self {
            id: row.id,
            role: row.role,
            cluster_id: row.cluster_id,
            node_id: row.node_id,
            kind: row.kind,
            level: row.level,
            subject: row.subject,
            body: row.body,
            created_at: format_time(row.created_at)?,
            is_read: row.is_read,
        })
    }
}

/// GET /v1/admin/messages - Newest messages first.
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    req: Request,
) -> ApiResult<Json<Vec<MessageResponse>>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;

    let filter = MessageFilter {
        cluster_id: query.cluster_id,
        node_id: query.node_id,
        unread_only: query.unread_only,
        limit: query.limit,
    };
    let messages = state
        .metadata
        .list_messages(&filter)
        .await?
        .into_iter()
        .map(MessageResponse::from_row)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(messages))
}

/// POST /v1/admin/messages/{id}/read
pub async fn mark_message_read(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    req: Request,
) -> ApiResult<StatusCode> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    state.metadata.mark_message_read(message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Cluster task queue
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ClusterTaskQuery {
    pub role: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClusterTaskResponse {
    pub id: i64,
    pub role: String,
    pub cluster_id: i64,
    pub node_id: i64,
    pub kind: String,
    pub state: String,
    pub generation: i64,
    pub claimed_by: Option<String>,
    pub created_at: String,
    pub claimed_at: Option<String>,
}

impl ClusterTaskResponse {
    fn from_row(row: ClusterTaskRow) -> ApiResult<Self> {
        Ok(Self {
            id: row.id,
            role: row.role,
            cluster_id: row.cluster_id,
            node_id: row.node_id,
            kind: row.kind,
            state: row.state,
            generation: row.generation,
            claimed_by: row.claimed_by,
            created_at: format_time(row.created_at)?,
            claimed_at: format_time_opt(row.claimed_at)?,
        })
    }
}

/// GET /v1/admin/cluster-tasks - Tasks not yet extracted.
pub async fn list_cluster_tasks(
    State(state): State<AppState>,
    Query(query): Query<ClusterTaskQuery>,
    req: Request,
) -> ApiResult<Json<Vec<ClusterTaskResponse>>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;

    let role = query.role.as_deref().map(NodeRole::parse).transpose()?;
    let tasks = state
        .metadata
        .list_cluster_tasks(role)
        .await?
        .into_iter()
        .map(ClusterTaskResponse::from_row)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueTaskRequest {
    pub cluster_id: i64,
    /// Zero or absent targets every node of the cluster.
    #[serde(default)]
    pub node_id: i64,
    pub kind: String,
}

/// POST /v1/admin/cluster-tasks - Nudge the nodes of a cluster by hand.
///
/// Used to force a full re-pull (`configChanged`) or to replay a change
/// kind after restoring a node.
pub async fn enqueue_cluster_task(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<StatusCode> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: EnqueueTaskRequest = read_json(req).await?;

    let kind = TaskKind::parse(&body.kind)?;
    let cluster = state
        .metadata
        .get_cluster(body.cluster_id)
        .await?
        .filter(|c| c.is_enabled())
        .ok_or_else(|| ApiError::NotFound(format!("cluster {} not found", body.cluster_id)))?;
    let role = cluster.role()?;

    if body.node_id != 0 {
        let node = state
            .metadata
            .get_node(body.node_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("node {} not found", body.node_id)))?;
        if node.cluster_id != cluster.id {
            return Err(ApiError::BadRequest(format!(
                "node {} is not in cluster {}",
                node.id, cluster.id
            )));
        }
    }

    state
        .metadata
        .enqueue_cluster_task(role, cluster.id, body.node_id, kind)
        .await?;

    Ok(StatusCode::ACCEPTED)
}

// =============================================================================
// Versions
// =============================================================================

/// GET /v1/admin/versions - Current value of every version namespace.
pub async fn list_versions(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<BTreeMap<&'static str, i64>>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;

    let mut versions = BTreeMap::new();
    for kind in EntityKind::ALL {
        let namespace = kind.namespace();
        versions.insert(namespace, state.metadata.current_version(namespace).await?);
    }
    Ok(Json(versions))
}
