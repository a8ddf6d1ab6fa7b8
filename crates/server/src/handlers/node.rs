//! Endpoints called by nodes: pulls, heartbeats, task polling and the
//! command stream.

use super::common::{format_time, read_json};
use crate::auth::{AuthenticatedNode, require_node};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use crate::stream::{CommandConnection, CommandHub};
use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use meridian_core::{CommandMessage, EntityKind, ListAfterVersionResponse, TaskAck};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub version: i64,
    pub limit: Option<u32>,
}

/// GET /v1/sync/{kind}?version=V&limit=N - Rows changed after `version`.
///
/// Tombstones are included so nodes can drop deleted rows. The checkpoint
/// is the highest version returned, or `version` itself when nothing
/// changed.
pub async fn list_after_version(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<SyncQuery>,
    req: Request,
) -> ApiResult<Json<ListAfterVersionResponse>> {
    let node = require_node(&req)?;
    let kind = EntityKind::parse(&kind)
        .map_err(|_| ApiError::NotFound(format!("unknown entity kind: {kind}")))?;

    if query.version < 0 {
        return Err(meridian_core::Error::InvalidVersion(format!(
            "version must not be negative, got {}",
            query.version
        ))
        .into());
    }
    if let Some(role) = kind.fixed_role()
        && role != node.role
    {
        return Err(ApiError::Forbidden(format!(
            "{kind} is not distributed to {} nodes",
            node.role
        )));
    }

    let limit = state.config.sync.effective_limit(query.limit);
    let rows = state
        .metadata
        .list_after_version(kind, node.cluster_id, query.version, limit)
        .await?;

    metrics::SYNC_REQUESTS.with_label_values(&[kind.as_str()]).inc();
    metrics::SYNC_ROWS_SERVED
        .with_label_values(&[kind.as_str()])
        .inc_by(rows.len() as u64);

    let checkpoint = rows
        .iter()
        .map(|r| r.version)
        .max()
        .unwrap_or(query.version);
    Ok(Json(ListAfterVersionResponse { rows, checkpoint }))
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub node_id: i64,
    /// The node was considered inactive before this heartbeat.
    pub reactivated: bool,
}

/// POST /v1/node/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<HeartbeatResponse>> {
    let node_id = require_node(&req)?.node_id;
    let body: HeartbeatRequest = read_json(req).await?;

    let status_json = body
        .status
        .map(|s| serde_json::to_string(&s))
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("invalid status: {e}")))?;
    let reactivated = state
        .metadata
        .record_heartbeat(node_id, status_json.as_deref(), OffsetDateTime::now_utc())
        .await?;
    if reactivated {
        tracing::info!(node_id, "Node active again");
    }

    Ok(Json(HeartbeatResponse {
        node_id,
        reactivated,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeTaskResponse {
    pub id: i64,
    pub kind: String,
    pub version: i64,
    pub created_at: String,
}

/// GET /v1/node/tasks - Pending node tasks of the caller.
pub async fn list_node_tasks(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<Vec<NodeTaskResponse>>> {
    let node = require_node(&req)?;

    let tasks = state
        .metadata
        .list_node_tasks(node.role, node.node_id)
        .await?
        .into_iter()
        .map(|row| {
            Ok(NodeTaskResponse {
                id: row.id,
                kind: row.kind,
                version: row.version,
                created_at: format_time(row.created_at)?,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
pub struct AckTasksRequest {
    pub tasks: Vec<TaskAck>,
}

#[derive(Debug, Serialize)]
pub struct AckTasksResponse {
    pub deleted: u64,
}

/// POST /v1/node/tasks/ack - Delete handled tasks.
///
/// Each entry carries the version the node saw, so a task refreshed since the
/// node listed it stays pending. Unknown ids are ignored.
pub async fn ack_node_tasks(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<AckTasksResponse>> {
    let node_id = require_node(&req)?.node_id;
    let body: AckTasksRequest = read_json(req).await?;

    let deleted = state
        .metadata
        .delete_node_tasks(node_id, &body.tasks)
        .await?;
    Ok(Json(AckTasksResponse { deleted }))
}

/// GET /v1/node/stream - Upgrade to the node's command stream.
pub async fn command_stream(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    req: Request,
) -> ApiResult<Response> {
    let node = require_node(&req)?.clone();
    let hub = state.hub.clone();

    let pending = state
        .metadata
        .list_node_tasks(node.role, node.node_id)
        .await?
        .len();

    Ok(ws.on_upgrade(move |socket| async move {
        let connection = hub.connect(node.node_id).await;
        if pending > 0 {
            hub.notify_new_task(node.node_id).await;
        }
        pump(hub, node, connection, socket).await;
    }))
}

async fn pump(hub: Arc<CommandHub>, node: AuthenticatedNode, connection: CommandConnection, socket: WebSocket) {
    let CommandConnection {
        connection_id,
        mut receiver,
    } = connection;
    let node_id = node.node_id;
    let (mut sink, mut inbound) = socket.split();

    loop {
        tokio::select! {
            outbound = receiver.recv() => {
                // None: replaced by a newer connection.
                let Some(message) = outbound else { break };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(node_id, error = %e, "Failed to encode command");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => match CommandMessage::from_json(text.as_str()) {
                    Ok(message) => {
                        hub.deliver(node_id, message).await;
                    }
                    Err(e) => {
                        tracing::warn!(node_id, error = %e, "Ignoring malformed stream message");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(node_id, error = %e, "Command stream read failed");
                    break;
                }
            }
        }
    }

    hub.disconnect(node_id, connection_id).await;
    tracing::debug!(node_id, unique_id = %node.unique_id, "Command stream closed");
}
