//! Bootstrap token marker repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Tracks which admin token was created from configuration.
#[async_trait]
pub trait BootstrapRepo: Send + Sync {
    async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>>;

    async fn set_bootstrap_token_id(&self, token_id: Uuid) -> MetadataResult<()>;

    async fn clear_bootstrap_token_id(&self) -> MetadataResult<()>;
}
