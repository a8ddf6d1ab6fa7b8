//! Authentication-related endpoints.

use super::common::format_time_opt;
use crate::auth::{get_auth, require_node};
use crate::error::{ApiError, ApiResult};
use axum::Json;
use axum::extract::Request;
use serde::Serialize;

/// Identity of the caller.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WhoamiResponse {
    Token {
        token_id: String,
        scopes: Vec<String>,
        expires_at: Option<String>,
    },
    Node {
        node_id: i64,
        cluster_id: i64,
        role: String,
        unique_id: String,
    },
}

/// GET /v1/auth/whoami - Return the identity attached to the request.
pub async fn whoami(req: Request) -> ApiResult<Json<WhoamiResponse>> {
    if let Some(auth) = get_auth(&req) {
        let token = &auth.token;
        let mut scopes: Vec<String> = token
            .scopes
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        scopes.sort();

        return Ok(Json(WhoamiResponse::Token {
            token_id: token.id.to_string(),
            scopes,
            expires_at: format_time_opt(token.expires_at)?,
        }));
    }

    match require_node(&req) {
        Ok(node) => Ok(Json(WhoamiResponse::Node {
            node_id: node.node_id,
            cluster_id: node.cluster_id,
            role: node.role.to_string(),
            unique_id: node.unique_id.clone(),
        })),
        Err(_) => Err(ApiError::Unauthorized(
            "authentication required".to_string(),
        )),
    }
}
