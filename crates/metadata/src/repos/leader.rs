//! Leader lease repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use time::OffsetDateTime;

#[async_trait]
pub trait LeaderRepo: Send + Sync {
    /// Take or renew the single lease row. Succeeds when `holder` already
    /// holds it or the current lease expired before `now`.
    async fn try_acquire_lease(
        &self,
        holder: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Current holder, if the lease has not expired at `now`.
    async fn current_leader(&self, now: OffsetDateTime) -> MetadataResult<Option<String>>;
}
