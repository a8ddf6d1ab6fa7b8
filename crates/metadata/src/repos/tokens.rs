//! Admin token repository.

use crate::error::MetadataResult;
use crate::models::TokenRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for token operations.
#[async_trait]
pub trait TokenRepo: Send + Sync {
    async fn create_token(&self, token: &TokenRow) -> MetadataResult<()>;

    /// Look up by SHA-256 hex of the secret.
    async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>>;

    async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>>;

    async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()>;

    async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()>;

    /// Newest first.
    async fn list_tokens(&self) -> MetadataResult<Vec<TokenRow>>;
}
