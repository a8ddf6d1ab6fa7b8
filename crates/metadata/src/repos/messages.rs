//! User-visible message repository.

use crate::error::MetadataResult;
use crate::models::{MessageFilter, MessageRow, NewMessage};
use async_trait::async_trait;

#[async_trait]
pub trait MessageRepo: Send + Sync {
    async fn create_message(&self, message: &NewMessage) -> MetadataResult<MessageRow>;

    /// Newest first.
    async fn list_messages(&self, filter: &MessageFilter) -> MetadataResult<Vec<MessageRow>>;

    async fn mark_message_read(&self, message_id: i64) -> MetadataResult<()>;
}
