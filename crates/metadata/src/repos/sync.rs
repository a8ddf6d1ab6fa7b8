//! Syncable entity repository.

use crate::error::MetadataResult;
use crate::models::{
    DnsDomainRow, DnsKeyFields, DnsKeyRow, DnsRecordFields, DnsRecordRow, DnsRouteFields,
    DnsRouteRow,
};
use async_trait::async_trait;
use meridian_core::{EntityDelta, EntityKind};

/// DNS entities and the pull query shared by every entity kind.
///
/// Mutations never delete rows. Disabling sets the tombstone state and bumps
/// the version one last time so pulls can observe the deletion.
#[async_trait]
pub trait SyncRepo: Send + Sync {
    /// Rows of `kind` in `cluster_id` with `version > after`, ascending by
    /// version, tombstones included.
    async fn list_after_version(
        &self,
        kind: EntityKind,
        cluster_id: i64,
        after: i64,
        limit: u32,
    ) -> MetadataResult<Vec<EntityDelta>>;

    async fn get_entity(&self, kind: EntityKind, id: i64) -> MetadataResult<Option<EntityDelta>>;

    /// Tombstone any syncable entity. Returns the final version.
    async fn disable_entity(&self, kind: EntityKind, id: i64) -> MetadataResult<i64>;

    /// Bring a tombstoned entity back. Domains are revived in place; records,
    /// keys and routes are copied into a new row. Returns the live id.
    async fn recreate_entity(&self, kind: EntityKind, id: i64) -> MetadataResult<i64>;

    /// Creating a name that exists as a tombstone in the cluster revives it.
    async fn create_domain(&self, cluster_id: i64, name: &str) -> MetadataResult<DnsDomainRow>;

    async fn get_domain(&self, domain_id: i64) -> MetadataResult<Option<DnsDomainRow>>;

    async fn rename_domain(&self, domain_id: i64, name: &str) -> MetadataResult<DnsDomainRow>;

    async fn create_record(
        &self,
        domain_id: i64,
        fields: &DnsRecordFields,
    ) -> MetadataResult<DnsRecordRow>;

    async fn update_record(
        &self,
        record_id: i64,
        fields: &DnsRecordFields,
    ) -> MetadataResult<DnsRecordRow>;

    async fn create_key(&self, domain_id: i64, fields: &DnsKeyFields)
    -> MetadataResult<DnsKeyRow>;

    async fn update_key(&self, key_id: i64, fields: &DnsKeyFields) -> MetadataResult<DnsKeyRow>;

    async fn create_route(
        &self,
        cluster_id: i64,
        fields: &DnsRouteFields,
    ) -> MetadataResult<DnsRouteRow>;

    async fn update_route(
        &self,
        route_id: i64,
        fields: &DnsRouteFields,
    ) -> MetadataResult<DnsRouteRow>;
}
