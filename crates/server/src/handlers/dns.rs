//! DNS configuration endpoints and generic tombstone management.
//!
//! Every mutation goes through the metadata store, which bumps the kind's
//! version and queues a cluster task in the same transaction. Responses are
//! the entity's pull representation so callers can see the new version.

use super::common::read_json;
use crate::auth::require_auth;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use meridian_core::token::TokenScope;
use meridian_core::{EntityDelta, EntityKind};
use meridian_metadata::models::{DnsKeyFields, DnsRecordFields, DnsRouteFields};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct DomainRequest {
    pub name: String,
}

fn validate_record(fields: &DnsRecordFields) -> ApiResult<()> {
    if fields.record_type.trim().is_empty() {
        return Err(ApiError::BadRequest("record type is required".to_string()));
    }
    if fields.ttl <= 0 {
        return Err(ApiError::BadRequest(format!(
            "ttl must be positive, got {}",
            fields.ttl
        )));
    }
    Ok(())
}

/// POST /v1/admin/clusters/{cluster_id}/domains
pub async fn create_domain(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    req: Request,
) -> ApiResult<(StatusCode, Json<EntityDelta>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: DomainRequest = read_json(req).await?;

    let row = state.metadata.create_domain(cluster_id, &body.name).await?;
    tracing::info!(cluster_id, domain_id = row.id, version = row.version, "Domain saved");

    Ok((StatusCode::CREATED, Json(row.to_delta())))
}

/// PUT /v1/admin/domains/{domain_id}
pub async fn rename_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<EntityDelta>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let body: DomainRequest = read_json(req).await?;

    let row = state.metadata.rename_domain(domain_id, &body.name).await?;
    Ok(Json(row.to_delta()))
}

/// POST /v1/admin/domains/{domain_id}/records
pub async fn create_record(
    State(state): State<AppState>,
    Path(domain_id): Path<i64>,
    req: Request,
) -> ApiResult<(StatusCode, Json<EntityDelta>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let fields: DnsRecordFields = read_json(req).await?;
    validate_record(&fields)?;

    let row = state.metadata.create_record(domain_id, &fields).await?;
    Ok((StatusCode::CREATED, Json(row.to_delta())))
}

/// PUT /v1/admin/records/{record_id}
pub async fn update_record(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<EntityDelta>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let fields: DnsRecordFields = read_json(req).await?;
    validate_record(&fields)?;

    let row = state.metadata.update_record(record_id, &fields).await?;
    Ok(Json(row.to_delta()))
}

/// POST /v1/admin/domains/{domain_id}/keys
pub async fn create_key(
    State(state): State<AppState>,
    Path(domain_id): Path<i64>,
    req: Request,
) -> ApiResult<(StatusCode, Json<EntityDelta>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let fields: DnsKeyFields = read_json(req).await?;

    let row = state.metadata.create_key(domain_id, &fields).await?;
    Ok((StatusCode::CREATED, Json(row.to_delta())))
}

/// PUT /v1/admin/keys/{key_id}
pub async fn update_key(
    State(state): State<AppState>,
    Path(key_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<EntityDelta>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let fields: DnsKeyFields = read_json(req).await?;

    let row = state.metadata.update_key(key_id, &fields).await?;
    Ok(Json(row.to_delta()))
}

/// POST /v1/admin/clusters/{cluster_id}/routes
pub async fn create_route(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    req: Request,
) -> ApiResult<(StatusCode, Json<EntityDelta>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let fields: DnsRouteFields = read_json(req).await?;

    let row = state.metadata.create_route(cluster_id, &fields).await?;
    Ok((StatusCode::CREATED, Json(row.to_delta())))
}

/// PUT /v1/admin/routes/{route_id}
pub async fn update_route(
    State(state): State<AppState>,
    Path(route_id): Path<i64>,
    req: Request,
) -> ApiResult<Json<EntityDelta>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let fields: DnsRouteFields = read_json(req).await?;

    let row = state.metadata.update_route(route_id, &fields).await?;
    Ok(Json(row.to_delta()))
}

// =============================================================================
// Any syncable kind
// =============================================================================

#[derive(Debug, Serialize)]
pub struct TombstoneResponse {
    pub id: i64,
    pub kind: EntityKind,
    pub version: i64,
}

#[derive(Debug, Serialize)]
pub struct RecreateResponse {
    /// Id of the live row, which differs from the tombstone for every kind
    /// except domains.
    pub id: i64,
    pub kind: EntityKind,
    pub previous_id: i64,
}

fn parse_kind(kind: &str) -> ApiResult<EntityKind> {
    EntityKind::parse(kind).map_err(|_| ApiError::NotFound(format!("unknown entity kind: {kind}")))
}

/// GET /v1/admin/entities/{kind}/{id}
pub async fn get_entity(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    req: Request,
) -> ApiResult<Json<EntityDelta>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterRead)?;
    let kind = parse_kind(&kind)?;

    let delta = state
        .metadata
        .get_entity(kind, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{kind} {id} not found")))?;
    Ok(Json(delta))
}

/// DELETE /v1/admin/entities/{kind}/{id} - Tombstone an entity.
///
/// Deleting an existing tombstone is a no-op that reports its version.
pub async fn delete_entity(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    req: Request,
) -> ApiResult<Json<TombstoneResponse>> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let kind = parse_kind(&kind)?;

    let version = state.metadata.disable_entity(kind, id).await?;
    if kind == EntityKind::Node {
        state.metadata.delete_tasks_for_node(id).await?;
    }
    tracing::info!(kind = %kind, id, version, "Entity disabled");

    Ok(Json(TombstoneResponse { id, kind, version }))
}

/// POST /v1/admin/entities/{kind}/{id}/recreate - Revive a tombstone.
pub async fn recreate_entity(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
    req: Request,
) -> ApiResult<(StatusCode, Json<RecreateResponse>)> {
    require_auth(&req)?.require_scope(TokenScope::ClusterAdmin)?;
    let kind = parse_kind(&kind)?;

    let live_id = state.metadata.recreate_entity(kind, id).await?;
    tracing::info!(kind = %kind, previous_id = id, id = live_id, "Entity recreated");

    Ok((
        StatusCode::CREATED,
        Json(RecreateResponse {
            id: live_id,
            kind,
            previous_id: id,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_validation() {
        let mut fields: DnsRecordFields =
            serde_json::from_str(r#"{"name":"www","type":"A","value":"10.0.0.1"}"#).unwrap();
        assert_eq!(fields.ttl, 600);
        validate_record(&fields).unwrap();

        fields.ttl = 0;
        assert!(validate_record(&fields).is_err());
    }

    #[test]
    fn test_unknown_kind_is_not_found() {
        assert!(matches!(parse_kind("zones"), Err(ApiError::NotFound(_))));
        assert_eq!(parse_kind("records").unwrap(), EntityKind::Record);
    }
}
