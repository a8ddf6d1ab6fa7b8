//! Authentication and authorization middleware.
//!
//! Two kinds of callers reach the API:
//! - operators, with a bearer token checked against the token table;
//! - nodes, with their unique id and secret in `X-Node-Id`/`X-Node-Secret`.
//!
//! The middleware only attaches identities to the request. Handlers decide
//! which identity they require.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use meridian_core::NodeRole;
use meridian_core::token::{Token, TokenId, TokenScope};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

pub use meridian_core::cluster::{NODE_ID_HEADER, NODE_SECRET_HEADER};

/// Longer trace IDs are truncated to prevent log bloat and log injection.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Sanitize a client-provided value: at most MAX_TRACE_ID_LEN printable
    /// ASCII characters.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator authenticated with an admin token.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub token: Token,
}

impl AuthenticatedUser {
    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.token.has_scope(scope)
    }

    /// Require a specific scope, returning an error if not present.
    pub fn require_scope(&self, scope: TokenScope) -> ApiResult<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "missing required scope: {}",
                scope
            )))
        }
    }
}

/// Node authenticated with its unique id and secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedNode {
    pub node_id: i64,
    pub cluster_id: i64,
    pub role: NodeRole,
    pub unique_id: String,
}

/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

fn extract_node_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let unique_id = headers.get(NODE_ID_HEADER)?.to_str().ok()?;
    let secret = headers.get(NODE_SECRET_HEADER)?.to_str().ok()?;
    Some((unique_id.to_string(), secret.to_string()))
}

fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Hash a token for storage lookup.
pub(crate) fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compares digests so neither content nor length leaks through timing.
fn secrets_match(a: &str, b: &str) -> bool {
    let a = Sha256::digest(a.as_bytes());
    let b = Sha256::digest(b.as_bytes());
    a.as_slice().ct_eq(b.as_slice()).into()
}

async fn authenticate_token(state: &AppState, token_str: &str) -> ApiResult<Option<AuthenticatedUser>> {
    let token_hash = hash_token(token_str);
    let Some(token_row) = state.metadata.get_token_by_hash(&token_hash).await? else {
        return Ok(None);
    };

    let scopes: Vec<String> = serde_json::from_str(&token_row.scopes)
        .map_err(|e| ApiError::Internal(format!("invalid token scopes: {e}")))?;
    let scopes: HashSet<TokenScope> = scopes
        .iter()
        .filter_map(|s| match TokenScope::parse(s) {
            Ok(scope) => Some(scope),
            Err(_) => {
                tracing::warn!(
                    token_id = %token_row.token_id,
                    invalid_scope = %s,
                    "Token contains invalid scope, ignoring"
                );
                None
            }
        })
        .collect();

    let token = Token {
        id: TokenId::from(token_row.token_id),
        scopes,
        expires_at: token_row.expires_at,
        revoked_at: token_row.revoked_at,
        created_at: token_row.created_at,
        description: token_row.description,
    };

    if !token.is_valid() {
        return Err(ApiError::Unauthorized(
            "token expired or revoked".to_string(),
        ));
    }

    // Fire and forget.
    let metadata = state.metadata.clone();
    let token_id = token_row.token_id;
    tokio::spawn(async move {
        let _ = metadata
            .touch_token(token_id, OffsetDateTime::now_utc())
            .await;
    });

    Ok(Some(AuthenticatedUser { token }))
}

async fn authenticate_node(state: &AppState, unique_id: &str, secret: &str) -> ApiResult<AuthenticatedNode> {
    let invalid = || ApiError::Unauthorized("invalid node credentials".to_string());

    let node = state
        .metadata
        .get_node_by_unique_id(unique_id)
        .await?
        .ok_or_else(invalid)?;
    if !node.is_enabled() || !node.is_on || !secrets_match(&node.secret, secret) {
        return Err(invalid());
    }

    let cluster = state
        .metadata
        .get_cluster(node.cluster_id)
        .await?
        .filter(|c| c.is_enabled())
        .ok_or_else(invalid)?;

    Ok(AuthenticatedNode {
        node_id: node.id,
        cluster_id: cluster.id,
        role: cluster.role()?,
        unique_id: node.unique_id,
    })
}

/// Validates credentials and sets up the trace context.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    if let Some(token_str) = extract_bearer_token(&req)
        && let Some(user) = authenticate_token(&state, token_str).await?
    {
        req.extensions_mut().insert(user);
    }

    if let Some((unique_id, secret)) = extract_node_credentials(req.headers()) {
        let node = authenticate_node(&state, &unique_id, &secret).await?;
        req.extensions_mut().insert(node);
    }

    let response = next
        .run(req)
        .instrument(tracing::info_span!("request", trace_id = %trace_id_str))
        .await;

    Ok(response)
}

/// Require an admin token.
pub fn require_auth(req: &Request) -> ApiResult<&AuthenticatedUser> {
    req.extensions()
        .get::<AuthenticatedUser>()
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}

/// Require node credentials.
pub fn require_node(req: &Request) -> ApiResult<&AuthenticatedNode> {
    req.extensions()
        .get::<AuthenticatedNode>()
        .ok_or_else(|| ApiError::Unauthorized("node credentials required".to_string()))
}

pub fn get_auth(req: &Request) -> Option<&AuthenticatedUser> {
    req.extensions().get::<AuthenticatedUser>()
}

pub fn get_trace_id(req: &Request) -> Option<&TraceId> {
    req.extensions().get::<TraceId>()
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_is_sanitized() {
        let id = TraceId::from_client("abc\n\tdef");
        assert_eq!(id.as_str(), "abcdef");

        let long = "x".repeat(500);
        assert_eq!(TraceId::from_client(&long).as_str().len(), MAX_TRACE_ID_LEN);

        assert!(!TraceId::from_client("\n").as_str().is_empty());
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        assert_eq!(
            hash_token("test-admin-token"),
            hash_token("test-admin-token")
        );
        assert_eq!(hash_token("abc").len(), 64);
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cres"));
        assert!(!secrets_match("s3cret", "s3cret!"));
        assert!(!secrets_match("", "x"));
        assert!(secrets_match("", ""));
    }

    #[test]
    fn test_node_credentials_need_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(NODE_ID_HEADER, "u-1".parse().unwrap());
        assert!(extract_node_credentials(&headers).is_none());

        headers.insert(NODE_SECRET_HEADER, "s-1".parse().unwrap());
        assert_eq!(
            extract_node_credentials(&headers),
            Some(("u-1".to_string(), "s-1".to_string()))
        );
    }
}
