//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    BootstrapRepo, ClusterRepo, ClusterTaskRepo, LeaderRepo, MessageRepo, NodeRepo, NodeTaskRepo,
    SyncRepo, TokenRepo, VersionRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    VersionRepo
    + SyncRepo
    + ClusterRepo
    + NodeRepo
    + ClusterTaskRepo
    + NodeTaskRepo
    + MessageRepo
    + TokenRepo
    + BootstrapRepo
    + LeaderRepo
    + Send
    + Sync
{
    /// Create tables and indexes that do not exist yet.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One connection serializes writers, which also serializes
            // version increments and task claims.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        if let Some(secs) = query_timeout_secs {
            tracing::info!(
                query_timeout_secs = secs,
                "SQLite metadata store ready (query timeout is advisory; use PostgreSQL for multi-instance deployments)"
            );
        }

        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::notifier::{self, table_name};
    use meridian_core::{
        ALL_NODES, EntityDelta, EntityKind, EntityState, NodeRole, TaskAck, TaskKind,
        Thresholds, UpDownCounter,
    };
    use sqlx::SqliteConnection;
    use sqlx::sqlite::SqliteRow;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn require_name(field: &str, value: &str) -> MetadataResult<()> {
        if value.trim().is_empty() {
            return Err(MetadataError::InvalidRequest(format!("{field} cannot be empty")));
        }
        Ok(())
    }

    async fn require_dns_cluster(conn: &mut SqliteConnection, cluster_id: i64) -> MetadataResult<()> {
        let cluster: Option<(String, String)> =
            sqlx::query_as("SELECT role, state FROM clusters WHERE id = ?")
                .bind(cluster_id)
                .fetch_optional(&mut *conn)
                .await?;
        match cluster {
            None => Err(MetadataError::NotFound(format!("cluster {cluster_id} not found"))),
            Some((_, state)) if state != EntityState::Enabled.as_str() => Err(
                MetadataError::InvalidRequest(format!("cluster {cluster_id} is disabled")),
            ),
            Some((role, _)) if role != NodeRole::Dns.as_str() => Err(MetadataError::InvalidRequest(
                format!("cluster {cluster_id} is not a dns cluster"),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Cluster of an enabled domain.
    async fn domain_cluster(conn: &mut SqliteConnection, domain_id: i64) -> MetadataResult<i64> {
        let domain: Option<(i64, String)> =
            sqlx::query_as("SELECT cluster_id, state FROM dns_domains WHERE id = ?")
                .bind(domain_id)
                .fetch_optional(&mut *conn)
                .await?;
        match domain {
            None => Err(MetadataError::NotFound(format!("domain {domain_id} not found"))),
            Some((_, state)) if state != EntityState::Enabled.as_str() => Err(
                MetadataError::InvalidRequest(format!("domain {domain_id} is disabled")),
            ),
            Some((cluster_id, _)) => Ok(cluster_id),
        }
    }

    /// Flip an enabled row to the tombstone state. `None` if it was not enabled.
    async fn tombstone(
        conn: &mut SqliteConnection,
        kind: EntityKind,
        id: i64,
    ) -> MetadataResult<Option<i64>> {
        let table = table_name(kind);
        let result = sqlx::query(&format!(
            "UPDATE {table} SET state = 'disabled' WHERE id = ? AND state = 'enabled'"
        ))
        .bind(id)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let version = notifier::sqlite::notify_update(conn, kind, id).await?;
        Ok(Some(version))
    }

    async fn delete_node_tasks_in(conn: &mut SqliteConnection, node_id: i64) -> MetadataResult<u64> {
        let cluster_tasks = sqlx::query("DELETE FROM cluster_tasks WHERE node_id = ?")
            .bind(node_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        let node_tasks = sqlx::query("DELETE FROM node_tasks WHERE node_id = ?")
            .bind(node_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(cluster_tasks + node_tasks)
    }

    async fn insert_record(
        conn: &mut SqliteConnection,
        domain_id: i64,
        cluster_id: i64,
        fields: &DnsRecordFields,
    ) -> MetadataResult<i64> {
        require_name("record name", &fields.name)?;
        require_name("record type", &fields.record_type)?;
        let now = now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dns_records (
                domain_id, cluster_id, name, record_type, value, ttl, route,
                version, state, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 'enabled', ?, ?)
            RETURNING id
            "#,
        )
        .bind(domain_id)
        .bind(cluster_id)
        .bind(&fields.name)
        .bind(&fields.record_type)
        .bind(&fields.value)
        .bind(fields.ttl)
        .bind(&fields.route)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn insert_key(
        conn: &mut SqliteConnection,
        domain_id: i64,
        cluster_id: i64,
        fields: &DnsKeyFields,
    ) -> MetadataResult<i64> {
        require_name("key name", &fields.name)?;
        let now = now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dns_keys (
                domain_id, cluster_id, name, algorithm, secret_type, secret,
                version, state, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, 'enabled', ?, ?)
            RETURNING id
            "#,
        )
        .bind(domain_id)
        .bind(cluster_id)
        .bind(&fields.name)
        .bind(&fields.algorithm)
        .bind(&fields.secret_type)
        .bind(&fields.secret)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn insert_route(
        conn: &mut SqliteConnection,
        cluster_id: i64,
        fields: &DnsRouteFields,
    ) -> MetadataResult<i64> {
        require_name("route name", &fields.name)?;
        require_name("route code", &fields.code)?;
        let now = now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO dns_routes (
                cluster_id, name, code, ranges_json, version, state, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 0, 'enabled', ?, ?)
            RETURNING id
            "#,
        )
        .bind(cluster_id)
        .bind(&fields.name)
        .bind(&fields.code)
        .bind(serde_json::to_string(&fields.ranges)?)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    impl SqliteStore {
        async fn deltas<R>(
            &self,
            kind: EntityKind,
            cluster_id: i64,
            after: i64,
            limit: u32,
            to_delta: fn(&R) -> EntityDelta,
        ) -> MetadataResult<Vec<EntityDelta>>
        where
            R: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin,
        {
            let table = table_name(kind);
            let rows = sqlx::query_as::<_, R>(&format!(
                "SELECT * FROM {table} WHERE cluster_id = ? AND version > ? ORDER BY version ASC LIMIT ?"
            ))
            .bind(cluster_id)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.iter().map(to_delta).collect())
        }

        async fn delta<R>(
            &self,
            kind: EntityKind,
            id: i64,
            to_delta: fn(&R) -> EntityDelta,
        ) -> MetadataResult<Option<EntityDelta>>
        where
            R: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin,
        {
            let table = table_name(kind);
            let row = sqlx::query_as::<_, R>(&format!("SELECT * FROM {table} WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.as_ref().map(to_delta))
        }
    }

    #[async_trait]
    impl VersionRepo for SqliteStore {
        async fn increase_version(&self, namespace: &str) -> MetadataResult<i64> {
            let mut tx = self.pool.begin().await?;
            let value = notifier::sqlite::increase_version(&mut tx, namespace).await?;
            tx.commit().await?;
            Ok(value)
        }

        async fn current_version(&self, namespace: &str) -> MetadataResult<i64> {
            let value: Option<i64> =
                sqlx::query_scalar("SELECT value FROM versions WHERE namespace = ?")
                    .bind(namespace)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(value.unwrap_or(0))
        }
    }

    #[async_trait]
    impl SyncRepo for SqliteStore {
        async fn list_after_version(
            &self,
            kind: EntityKind,
            cluster_id: i64,
            after: i64,
            limit: u32,
        ) -> MetadataResult<Vec<EntityDelta>> {
            match kind {
                EntityKind::Domain => {
                    self.deltas(kind, cluster_id, after, limit, DnsDomainRow::to_delta)
                        .await
                }
                EntityKind::Record => {
                    self.deltas(kind, cluster_id, after, limit, DnsRecordRow::to_delta)
                        .await
                }
                EntityKind::Key => {
                    self.deltas(kind, cluster_id, after, limit, DnsKeyRow::to_delta)
                        .await
                }
                EntityKind::Route => {
                    self.deltas(kind, cluster_id, after, limit, DnsRouteRow::to_delta)
                        .await
                }
                EntityKind::Node => {
                    self.deltas(kind, cluster_id, after, limit, NodeRow::to_delta)
                        .await
                }
            }
        }

        async fn get_entity(
            &self,
            kind: EntityKind,
            id: i64,
        ) -> MetadataResult<Option<EntityDelta>> {
            match kind {
                EntityKind::Domain => self.delta(kind, id, DnsDomainRow::to_delta).await,
                EntityKind::Record => self.delta(kind, id, DnsRecordRow::to_delta).await,
                EntityKind::Key => self.delta(kind, id, DnsKeyRow::to_delta).await,
                EntityKind::Route => self.delta(kind, id, DnsRouteRow::to_delta).await,
                EntityKind::Node => self.delta(kind, id, NodeRow::to_delta).await,
            }
        }

        async fn disable_entity(&self, kind: EntityKind, id: i64) -> MetadataResult<i64> {
            let table = table_name(kind);
            let mut tx = self.pool.begin().await?;

            let current: Option<i64> =
                sqlx::query_scalar(&format!("SELECT version FROM {table} WHERE id = ?"))
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(current) = current else {
                return Err(MetadataError::NotFound(format!("{kind} {id} not found")));
            };

            let Some(version) = tombstone(&mut tx, kind, id).await? else {
                // Already a tombstone.
                tx.commit().await?;
                return Ok(current);
            };

            match kind {
                EntityKind::Domain => {
                    for child in [EntityKind::Record, EntityKind::Key] {
                        let child_table = table_name(child);
                        let ids: Vec<i64> = sqlx::query_scalar(&format!(
                            "SELECT id FROM {child_table} WHERE domain_id = ? AND state = 'enabled' ORDER BY id"
                        ))
                        .bind(id)
                        .fetch_all(&mut *tx)
                        .await?;
                        for child_id in ids {
                            tombstone(&mut tx, child, child_id).await?;
                        }
                    }
                }
                EntityKind::Node => {
                    delete_node_tasks_in(&mut tx, id).await?;
                }
                _ => {}
            }

            tx.commit().await?;
            Ok(version)
        }

        async fn recreate_entity(&self, kind: EntityKind, id: i64) -> MetadataResult<i64> {
            let mut tx = self.pool.begin().await?;

            let live_id = match kind {
                EntityKind::Domain => {
                    let row = sqlx::query_as::<_, DnsDomainRow>(
                        "SELECT * FROM dns_domains WHERE id = ?",
                    )
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("domain {id} not found")))?;
                    if row.state == EntityState::Enabled.as_str() {
                        return Err(MetadataError::InvalidStateTransition {
                            from: row.state,
                            to: "enabled".to_string(),
                        });
                    }
                    require_dns_cluster(&mut tx, row.cluster_id).await?;
                    sqlx::query("UPDATE dns_domains SET state = 'enabled' WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    id
                }
                EntityKind::Record => {
                    let row = sqlx::query_as::<_, DnsRecordRow>(
                        "SELECT * FROM dns_records WHERE id = ?",
                    )
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("record {id} not found")))?;
                    if row.state == EntityState::Enabled.as_str() {
                        return Err(MetadataError::InvalidStateTransition {
                            from: row.state,
                            to: "enabled".to_string(),
                        });
                    }
                    let cluster_id = domain_cluster(&mut tx, row.domain_id).await?;
                    insert_record(&mut tx, row.domain_id, cluster_id, &row.fields()).await?
                }
                EntityKind::Key => {
                    let row = sqlx::query_as::<_, DnsKeyRow>("SELECT * FROM dns_keys WHERE id = ?")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or_else(|| MetadataError::NotFound(format!("key {id} not found")))?;
                    if row.state == EntityState::Enabled.as_str() {
                        return Err(MetadataError::InvalidStateTransition {
                            from: row.state,
                            to: "enabled".to_string(),
                        });
                    }
                    let cluster_id = domain_cluster(&mut tx, row.domain_id).await?;
                    insert_key(&mut tx, row.domain_id, cluster_id, &row.fields()).await?
                }
                EntityKind::Route => {
                    let row = sqlx::query_as::<_, DnsRouteRow>(
                        "SELECT * FROM dns_routes WHERE id = ?",
                    )
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("route {id} not found")))?;
                    if row.state == EntityState::Enabled.as_str() {
                        return Err(MetadataError::InvalidStateTransition {
                            from: row.state,
                            to: "enabled".to_string(),
                        });
                    }
                    require_dns_cluster(&mut tx, row.cluster_id).await?;
                    insert_route(&mut tx, row.cluster_id, &row.fields()).await?
                }
                EntityKind::Node => {
                    return Err(MetadataError::InvalidRequest(
                        "nodes cannot be recreated; create a new node".to_string(),
                    ));
                }
            };

            notifier::sqlite::notify_update(&mut tx, kind, live_id).await?;
            tx.commit().await?;
            Ok(live_id)
        }

        async fn create_domain(&self, cluster_id: i64, name: &str) -> MetadataResult<DnsDomainRow> {
            require_name("domain name", name)?;
            let mut tx = self.pool.begin().await?;
            require_dns_cluster(&mut tx, cluster_id).await?;

            let existing = sqlx::query_as::<_, DnsDomainRow>(
                "SELECT * FROM dns_domains WHERE cluster_id = ? AND name = ?",
            )
            .bind(cluster_id)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

            let id = match existing {
                Some(row) if row.state == EntityState::Enabled.as_str() => {
                    return Err(MetadataError::AlreadyExists(format!(
                        "domain '{name}' already exists in cluster {cluster_id}"
                    )));
                }
                Some(row) => {
                    sqlx::query("UPDATE dns_domains SET state = 'enabled' WHERE id = ?")
                        .bind(row.id)
                        .execute(&mut *tx)
                        .await?;
                    row.id
                }
                None => {
                    let now = now();
                    sqlx::query_scalar(
                        r#"
                        INSERT INTO dns_domains (cluster_id, name, version, state, created_at, updated_at)
                        VALUES (?, ?, 0, 'enabled', ?, ?)
                        RETURNING id
                        "#,
                    )
                    .bind(cluster_id)
                    .bind(name)
                    .bind(now)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?
                }
            };

            notifier::sqlite::notify_update(&mut tx, EntityKind::Domain, id).await?;
            let row = sqlx::query_as::<_, DnsDomainRow>("SELECT * FROM dns_domains WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn get_domain(&self, domain_id: i64) -> MetadataResult<Option<DnsDomainRow>> {
            let row = sqlx::query_as::<_, DnsDomainRow>("SELECT * FROM dns_domains WHERE id = ?")
                .bind(domain_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn rename_domain(&self, domain_id: i64, name: &str) -> MetadataResult<DnsDomainRow> {
            require_name("domain name", name)?;
            let mut tx = self.pool.begin().await?;
            let cluster_id = domain_cluster(&mut tx, domain_id).await?;

            let taken: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM dns_domains WHERE cluster_id = ? AND name = ? AND id != ?",
            )
            .bind(cluster_id)
            .bind(name)
            .bind(domain_id)
            .fetch_optional(&mut *tx)
            .await?;
            if taken.is_some() {
                return Err(MetadataError::AlreadyExists(format!(
                    "domain '{name}' already exists in cluster {cluster_id}"
                )));
            }

            sqlx::query("UPDATE dns_domains SET name = ? WHERE id = ?")
                .bind(name)
                .bind(domain_id)
                .execute(&mut *tx)
                .await?;
            notifier::sqlite::notify_update(&mut tx, EntityKind::Domain, domain_id).await?;
            let row = sqlx::query_as::<_, DnsDomainRow>("SELECT * FROM dns_domains WHERE id = ?")
                .bind(domain_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn create_record(
            &self,
            domain_id: i64,
            fields: &DnsRecordFields,
        ) -> MetadataResult<DnsRecordRow> {
            let mut tx = self.pool.begin().await?;
            let cluster_id = domain_cluster(&mut tx, domain_id).await?;
            let id = insert_record(&mut tx, domain_id, cluster_id, fields).await?;
            notifier::sqlite::notify_update(&mut tx, EntityKind::Record, id).await?;
            let row = sqlx::query_as::<_, DnsRecordRow>("SELECT * FROM dns_records WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn update_record(
            &self,
            record_id: i64,
            fields: &DnsRecordFields,
        ) -> MetadataResult<DnsRecordRow> {
            require_name("record name", &fields.name)?;
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE dns_records SET name = ?, record_type = ?, value = ?, ttl = ?, route = ?
                WHERE id = ? AND state = 'enabled'
                "#,
            )
            .bind(&fields.name)
            .bind(&fields.record_type)
            .bind(&fields.value)
            .bind(fields.ttl)
            .bind(&fields.route)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "enabled record {record_id} not found"
                )));
            }
            notifier::sqlite::notify_update(&mut tx, EntityKind::Record, record_id).await?;
            let row = sqlx::query_as::<_, DnsRecordRow>("SELECT * FROM dns_records WHERE id = ?")
                .bind(record_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn create_key(
            &self,
            domain_id: i64,
            fields: &DnsKeyFields,
        ) -> MetadataResult<DnsKeyRow> {
            let mut tx = self.pool.begin().await?;
            let cluster_id = domain_cluster(&mut tx, domain_id).await?;
            let id = insert_key(&mut tx, domain_id, cluster_id, fields).await?;
            notifier::sqlite::notify_update(&mut tx, EntityKind::Key, id).await?;
            let row = sqlx::query_as::<_, DnsKeyRow>("SELECT * FROM dns_keys WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn update_key(&self, key_id: i64, fields: &DnsKeyFields) -> MetadataResult<DnsKeyRow> {
            require_name("key name", &fields.name)?;
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE dns_keys SET name = ?, algorithm = ?, secret_type = ?, secret = ?
                WHERE id = ? AND state = 'enabled'
                "#,
            )
            .bind(&fields.name)
            .bind(&fields.algorithm)
            .bind(&fields.secret_type)
            .bind(&fields.secret)
            .bind(key_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "enabled key {key_id} not found"
                )));
            }
            notifier::sqlite::notify_update(&mut tx, EntityKind::Key, key_id).await?;
            let row = sqlx::query_as::<_, DnsKeyRow>("SELECT * FROM dns_keys WHERE id = ?")
                .bind(key_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn create_route(
            &self,
            cluster_id: i64,
            fields: &DnsRouteFields,
        ) -> MetadataResult<DnsRouteRow> {
            let mut tx = self.pool.begin().await?;
            require_dns_cluster(&mut tx, cluster_id).await?;
            let id = insert_route(&mut tx, cluster_id, fields).await?;
            notifier::sqlite::notify_update(&mut tx, EntityKind::Route, id).await?;
            let row = sqlx::query_as::<_, DnsRouteRow>("SELECT * FROM dns_routes WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn update_route(
            &self,
            route_id: i64,
            fields: &DnsRouteFields,
        ) -> MetadataResult<DnsRouteRow> {
            require_name("route name", &fields.name)?;
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE dns_routes SET name = ?, code = ?, ranges_json = ?
                WHERE id = ? AND state = 'enabled'
                "#,
            )
            .bind(&fields.name)
            .bind(&fields.code)
            .bind(serde_json::to_string(&fields.ranges)?)
            .bind(route_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "enabled route {route_id} not found"
                )));
            }
            notifier::sqlite::notify_update(&mut tx, EntityKind::Route, route_id).await?;
            let row = sqlx::query_as::<_, DnsRouteRow>("SELECT * FROM dns_routes WHERE id = ?")
                .bind(route_id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }
    }

    #[async_trait]
    impl ClusterRepo for SqliteStore {
        async fn create_cluster(&self, cluster: &NewCluster) -> MetadataResult<ClusterRow> {
            require_name("cluster name", &cluster.name)?;
            let policy = cluster
                .health_check
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let now = now();
            let row = sqlx::query_as::<_, ClusterRow>(
                r#"
                INSERT INTO clusters (name, role, state, health_check_json, auto_remote_start, created_at, updated_at)
                VALUES (?, ?, 'enabled', ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(&cluster.name)
            .bind(cluster.role.as_str())
            .bind(policy)
            .bind(cluster.auto_remote_start)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_cluster(&self, cluster_id: i64) -> MetadataResult<Option<ClusterRow>> {
            let row = sqlx::query_as::<_, ClusterRow>("SELECT * FROM clusters WHERE id = ?")
                .bind(cluster_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_clusters(
            &self,
            role: Option<NodeRole>,
            enabled_only: bool,
        ) -> MetadataResult<Vec<ClusterRow>> {
            let rows = sqlx::query_as::<_, ClusterRow>(
                r#"
                SELECT * FROM clusters
                WHERE (? IS NULL OR role = ?) AND (? = 0 OR state = 'enabled')
                ORDER BY id
                "#,
            )
            .bind(role.map(|r| r.as_str()))
            .bind(role.map(|r| r.as_str()))
            .bind(enabled_only)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_cluster(
            &self,
            cluster_id: i64,
            update: &ClusterUpdate,
        ) -> MetadataResult<ClusterRow> {
            let mut tx = self.pool.begin().await?;
            let mut row = sqlx::query_as::<_, ClusterRow>("SELECT * FROM clusters WHERE id = ?")
                .bind(cluster_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("cluster {cluster_id} not found")))?;

            if let Some(name) = &update.name {
                require_name("cluster name", name)?;
                row.name = name.clone();
            }
            if let Some(policy) = &update.health_check {
                row.health_check_json = policy.as_ref().map(serde_json::to_string).transpose()?;
            }
            if let Some(auto_remote_start) = update.auto_remote_start {
                row.auto_remote_start = auto_remote_start;
            }
            row.updated_at = now();

            sqlx::query(
                r#"
                UPDATE clusters SET name = ?, health_check_json = ?, auto_remote_start = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&row.name)
            .bind(&row.health_check_json)
            .bind(row.auto_remote_start)
            .bind(row.updated_at)
            .bind(cluster_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn disable_cluster(&self, cluster_id: i64) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                "UPDATE clusters SET state = 'disabled', updated_at = ? WHERE id = ?",
            )
            .bind(now())
            .bind(cluster_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "cluster {cluster_id} not found"
                )));
            }
            sqlx::query("DELETE FROM cluster_tasks WHERE cluster_id = ?")
                .bind(cluster_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl NodeRepo for SqliteStore {
        async fn create_node(&self, node: &NewNode) -> MetadataResult<NodeRow> {
            require_name("node name", &node.name)?;
            let mut tx = self.pool.begin().await?;

            let cluster_state: Option<String> =
                sqlx::query_scalar("SELECT state FROM clusters WHERE id = ?")
                    .bind(node.cluster_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            match cluster_state.as_deref() {
                None => {
                    return Err(MetadataError::NotFound(format!(
                        "cluster {} not found",
                        node.cluster_id
                    )));
                }
                Some("enabled") => {}
                Some(_) => {
                    return Err(MetadataError::InvalidRequest(format!(
                        "cluster {} is disabled",
                        node.cluster_id
                    )));
                }
            }

            let taken: Option<i64> = sqlx::query_scalar("SELECT id FROM nodes WHERE unique_id = ?")
                .bind(&node.unique_id)
                .fetch_optional(&mut *tx)
                .await?;
            if taken.is_some() {
                return Err(MetadataError::AlreadyExists(format!(
                    "node unique id '{}' already exists",
                    node.unique_id
                )));
            }

            let now = now();
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO nodes (
                    cluster_id, unique_id, secret, name, is_on, is_active, is_up,
                    count_up, count_down, version, state, created_at, updated_at
                ) VALUES (?, ?, ?, ?, 1, 0, 1, 0, 0, 0, 'enabled', ?, ?)
                RETURNING id
                "#,
            )
            .bind(node.cluster_id)
            .bind(&node.unique_id)
            .bind(&node.secret)
            .bind(&node.name)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            notifier::sqlite::notify_update(&mut tx, EntityKind::Node, id).await?;
            let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn get_node(&self, node_id: i64) -> MetadataResult<Option<NodeRow>> {
            let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = ?")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_node_by_unique_id(&self, unique_id: &str) -> MetadataResult<Option<NodeRow>> {
            let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE unique_id = ?")
                .bind(unique_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_nodes(&self, cluster_id: i64) -> MetadataResult<Vec<NodeRow>> {
            let rows =
                sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE cluster_id = ? ORDER BY id")
                    .bind(cluster_id)
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows)
        }

        async fn list_enabled_nodes(&self, cluster_id: i64) -> MetadataResult<Vec<NodeRow>> {
            let rows = sqlx::query_as::<_, NodeRow>(
                "SELECT * FROM nodes WHERE cluster_id = ? AND state = 'enabled' AND is_on = 1 ORDER BY id",
            )
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn disable_node(&self, node_id: i64) -> MetadataResult<i64> {
            SyncRepo::disable_entity(self, EntityKind::Node, node_id).await
        }

        async fn add_ip_address(
            &self,
            address: &NewNodeIpAddress,
        ) -> MetadataResult<NodeIpAddressRow> {
            require_name("ip", &address.ip)?;
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query_as::<_, NodeIpAddressRow>(
                r#"
                INSERT INTO node_ip_addresses (
                    node_id, ip, is_on, can_access, is_up, count_up, count_down, sort_order, created_at
                ) VALUES (?, ?, 1, ?, 1, 0, 0, ?, ?)
                RETURNING *
                "#,
            )
            .bind(address.node_id)
            .bind(&address.ip)
            .bind(address.can_access)
            .bind(address.sort_order)
            .bind(now())
            .fetch_one(&mut *tx)
            .await?;
            notifier::sqlite::notify_update(&mut tx, EntityKind::Node, address.node_id).await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn list_ip_addresses(&self, node_id: i64) -> MetadataResult<Vec<NodeIpAddressRow>> {
            let rows = sqlx::query_as::<_, NodeIpAddressRow>(
                "SELECT * FROM node_ip_addresses WHERE node_id = ? ORDER BY sort_order, id",
            )
            .bind(node_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_node_up_count(
            &self,
            node_id: i64,
            ok: bool,
            thresholds: Thresholds,
        ) -> MetadataResult<Option<bool>> {
            let mut tx = self.pool.begin().await?;
            let current: Option<(bool, i64, i64)> =
                sqlx::query_as("SELECT is_up, count_up, count_down FROM nodes WHERE id = ?")
                    .bind(node_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let (is_up, count_up, count_down) = current
                .ok_or_else(|| MetadataError::NotFound(format!("node {node_id} not found")))?;

            let mut counter = UpDownCounter {
                is_up,
                count_up: u32::try_from(count_up).unwrap_or(u32::MAX),
                count_down: u32::try_from(count_down).unwrap_or(u32::MAX),
            };
            let flipped = counter.record(ok, thresholds);

            sqlx::query("UPDATE nodes SET is_up = ?, count_up = ?, count_down = ? WHERE id = ?")
                .bind(counter.is_up)
                .bind(i64::from(counter.count_up))
                .bind(i64::from(counter.count_down))
                .bind(node_id)
                .execute(&mut *tx)
                .await?;
            if flipped.is_some() {
                notifier::sqlite::notify_update(&mut tx, EntityKind::Node, node_id).await?;
            }
            tx.commit().await?;
            Ok(flipped)
        }

        async fn update_ip_up_count(
            &self,
            address_id: i64,
            ok: bool,
            thresholds: Thresholds,
        ) -> MetadataResult<Option<bool>> {
            let mut tx = self.pool.begin().await?;
            let current: Option<(i64, bool, i64, i64)> = sqlx::query_as(
                "SELECT node_id, is_up, count_up, count_down FROM node_ip_addresses WHERE id = ?",
            )
            .bind(address_id)
            .fetch_optional(&mut *tx)
            .await?;
            let (node_id, is_up, count_up, count_down) = current.ok_or_else(|| {
                MetadataError::NotFound(format!("ip address {address_id} not found"))
            })?;

            let mut counter = UpDownCounter {
                is_up,
                count_up: u32::try_from(count_up).unwrap_or(u32::MAX),
                count_down: u32::try_from(count_down).unwrap_or(u32::MAX),
            };
            let flipped = counter.record(ok, thresholds);

            sqlx::query(
                "UPDATE node_ip_addresses SET is_up = ?, count_up = ?, count_down = ? WHERE id = ?",
            )
            .bind(counter.is_up)
            .bind(i64::from(counter.count_up))
            .bind(i64::from(counter.count_down))
            .bind(address_id)
            .execute(&mut *tx)
            .await?;
            if flipped.is_some() {
                notifier::sqlite::notify_update(&mut tx, EntityKind::Node, node_id).await?;
            }
            tx.commit().await?;
            Ok(flipped)
        }

        async fn record_heartbeat(
            &self,
            node_id: i64,
            status_json: Option<&str>,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;
            let was_active: Option<bool> =
                sqlx::query_scalar("SELECT is_active FROM nodes WHERE id = ?")
                    .bind(node_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let was_active = was_active
                .ok_or_else(|| MetadataError::NotFound(format!("node {node_id} not found")))?;

            sqlx::query(
                r#"
                UPDATE nodes
                SET status_json = COALESCE(?, status_json), last_seen_at = ?, is_active = 1,
                    inactive_notified_at = NULL
                WHERE id = ?
                "#,
            )
            .bind(status_json)
            .bind(now)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
            if !was_active {
                notifier::sqlite::notify_update(&mut tx, EntityKind::Node, node_id).await?;
            }
            tx.commit().await?;
            Ok(!was_active)
        }

        async fn find_silent_nodes(
            &self,
            cluster_id: i64,
            seen_before: OffsetDateTime,
        ) -> MetadataResult<Vec<NodeRow>> {
            let rows = sqlx::query_as::<_, NodeRow>(
                r#"
                SELECT * FROM nodes
                WHERE cluster_id = ? AND state = 'enabled' AND is_on = 1
                  AND (last_seen_at IS NULL OR last_seen_at < ?)
                ORDER BY id
                "#,
            )
            .bind(cluster_id)
            .bind(seen_before)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn set_node_active(&self, node_id: i64, is_active: bool) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query("UPDATE nodes SET is_active = ? WHERE id = ? AND is_active != ?")
                .bind(is_active)
                .bind(node_id)
                .bind(is_active)
                .execute(&mut *tx)
                .await?;
            let changed = result.rows_affected() > 0;
            if changed {
                notifier::sqlite::notify_update(&mut tx, EntityKind::Node, node_id).await?;
            }
            tx.commit().await?;
            Ok(changed)
        }

        async fn mark_inactive_notified(
            &self,
            node_id: i64,
            at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query("UPDATE nodes SET inactive_notified_at = ? WHERE id = ?")
                .bind(at)
                .bind(node_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterTaskRepo for SqliteStore {
        async fn enqueue_cluster_task(
            &self,
            role: NodeRole,
            cluster_id: i64,
            node_id: i64,
            kind: TaskKind,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            notifier::sqlite::enqueue_cluster_task(&mut tx, role, cluster_id, node_id, kind, now())
                .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn claim_cluster_tasks(
            &self,
            role: NodeRole,
            claimer: &str,
            now: OffsetDateTime,
            stale_before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<ClusterTaskRow>> {
            let mut tx = self.pool.begin().await?;
            let candidates = sqlx::query_as::<_, ClusterTaskRow>(
                r#"
                SELECT * FROM cluster_tasks
                WHERE role = ? AND (state = 'pending' OR (state = 'extracting' AND claimed_at < ?))
                ORDER BY id
                LIMIT ?
                "#,
            )
            .bind(role.as_str())
            .bind(stale_before)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await?;

            let mut claimed = Vec::with_capacity(candidates.len());
            for mut task in candidates {
                // Conditional update: a concurrent claimer makes this a no-op.
                let result = sqlx::query(
                    r#"
                    UPDATE cluster_tasks SET state = 'extracting', claimed_by = ?, claimed_at = ?
                    WHERE id = ? AND (state = 'pending' OR (state = 'extracting' AND claimed_at < ?))
                    "#,
                )
                .bind(claimer)
                .bind(now)
                .bind(task.id)
                .bind(stale_before)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 1 {
                    task.state = "extracting".to_string();
                    task.claimed_by = Some(claimer.to_string());
                    task.claimed_at = Some(now);
                    claimed.push(task);
                }
            }
            tx.commit().await?;
            Ok(claimed)
        }

        async fn fan_out_cluster_task(&self, task: &ClusterTaskRow) -> MetadataResult<FanOut> {
            let kind = task.task_kind()?;
            let mut tx = self.pool.begin().await?;

            let node_ids: Vec<i64> = if task.node_id == ALL_NODES {
                sqlx::query_scalar(
                    "SELECT id FROM nodes WHERE cluster_id = ? AND state = 'enabled' AND is_on = 1 ORDER BY id",
                )
                .bind(task.cluster_id)
                .fetch_all(&mut *tx)
                .await?
            } else {
                sqlx::query_scalar(
                    "SELECT id FROM nodes WHERE id = ? AND cluster_id = ? AND state = 'enabled'",
                )
                .bind(task.node_id)
                .bind(task.cluster_id)
                .fetch_all(&mut *tx)
                .await?
            };

            let version: i64 = match kind.entity_kind() {
                Some(entity) => sqlx::query_scalar::<_, i64>(
                    "SELECT value FROM versions WHERE namespace = ?",
                )
                .bind(entity.namespace())
                .fetch_optional(&mut *tx)
                .await?
                .unwrap_or(0),
                None => 0,
            };

            let now = now();
            // A refresh always raises the row's version, so an ack of what the
            // node saw earlier no longer matches it.
            for node_id in &node_ids {
                sqlx::query(
                    r#"
                    INSERT INTO node_tasks (role, node_id, kind, version, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(role, node_id, kind)
                    DO UPDATE SET
                        version = MAX(excluded.version, node_tasks.version + 1),
                        created_at = excluded.created_at
                    "#,
                )
                .bind(&task.role)
                .bind(node_id)
                .bind(kind.as_str())
                .bind(version)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }

            let consumed = sqlx::query("DELETE FROM cluster_tasks WHERE id = ? AND generation = ?")
                .bind(task.id)
                .bind(task.generation)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if consumed == 0 {
                sqlx::query(
                    "UPDATE cluster_tasks SET state = 'pending', claimed_by = NULL, claimed_at = NULL WHERE id = ?",
                )
                .bind(task.id)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(FanOut {
                node_ids,
                completed: consumed > 0,
            })
        }

        async fn release_cluster_task(&self, task_id: i64) -> MetadataResult<()> {
            sqlx::query(
                r#"
                UPDATE cluster_tasks SET state = 'pending', claimed_by = NULL, claimed_at = NULL
                WHERE id = ? AND state = 'extracting'
                "#,
            )
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn list_cluster_tasks(
            &self,
            role: Option<NodeRole>,
        ) -> MetadataResult<Vec<ClusterTaskRow>> {
            let rows = sqlx::query_as::<_, ClusterTaskRow>(
                "SELECT * FROM cluster_tasks WHERE (? IS NULL OR role = ?) ORDER BY id",
            )
            .bind(role.map(|r| r.as_str()))
            .bind(role.map(|r| r.as_str()))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_cluster_tasks_for_cluster(&self, cluster_id: i64) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM cluster_tasks WHERE cluster_id = ?")
                .bind(cluster_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn delete_tasks_for_node(&self, node_id: i64) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;
            let count = delete_node_tasks_in(&mut tx, node_id).await?;
            tx.commit().await?;
            Ok(count)
        }
    }

    #[async_trait]
    impl NodeTaskRepo for SqliteStore {
        async fn list_node_tasks(
            &self,
            role: NodeRole,
            node_id: i64,
        ) -> MetadataResult<Vec<NodeTaskRow>> {
            let rows = sqlx::query_as::<_, NodeTaskRow>(
                "SELECT * FROM node_tasks WHERE role = ? AND node_id = ? ORDER BY id",
            )
            .bind(role.as_str())
            .bind(node_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_node_tasks(&self, node_id: i64, acks: &[TaskAck]) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;
            let mut count = 0;
            for ack in acks {
                let result = sqlx::query(
                    "DELETE FROM node_tasks WHERE id = ? AND node_id = ? AND version <= ?",
                )
                .bind(ack.id)
                .bind(node_id)
                .bind(ack.version)
                .execute(&mut *tx)
                .await?;
                count += result.rows_affected();
            }
            tx.commit().await?;
            Ok(count)
        }
    }

    #[async_trait]
    impl MessageRepo for SqliteStore {
        async fn create_message(&self, message: &NewMessage) -> MetadataResult<MessageRow> {
            let row = sqlx::query_as::<_, MessageRow>(
                r#"
                INSERT INTO messages (role, cluster_id, node_id, kind, level, subject, body, created_at, is_read)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
                RETURNING *
                "#,
            )
            .bind(message.role.as_str())
            .bind(message.cluster_id)
            .bind(message.node_id)
            .bind(message.kind.as_str())
            .bind(message.level.as_str())
            .bind(&message.subject)
            .bind(&message.body)
            .bind(now())
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_messages(&self, filter: &MessageFilter) -> MetadataResult<Vec<MessageRow>> {
            let rows = sqlx::query_as::<_, MessageRow>(
                r#"
                SELECT * FROM messages
                WHERE (? IS NULL OR cluster_id = ?)
                  AND (? IS NULL OR node_id = ?)
                  AND (? = 0 OR is_read = 0)
                ORDER BY id DESC
                LIMIT ?
                "#,
            )
            .bind(filter.cluster_id)
            .bind(filter.cluster_id)
            .bind(filter.node_id)
            .bind(filter.node_id)
            .bind(filter.unread_only)
            .bind(i64::from(filter.limit.unwrap_or(100)))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn mark_message_read(&self, message_id: i64) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ?")
                .bind(message_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "message {message_id} not found"
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TokenRepo for SqliteStore {
        async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO tokens (
                    token_id, token_hash, scopes, expires_at,
                    revoked_at, created_at, last_used_at, description
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(token.token_id)
            .bind(&token.token_hash)
            .bind(&token.scopes)
            .bind(token.expires_at)
            .bind(token.revoked_at)
            .bind(token.created_at)
            .bind(token.last_used_at)
            .bind(&token.description)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = ?")
                .bind(token_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET last_used_at = ? WHERE token_id = ?")
                .bind(used_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE tokens SET revoked_at = ? WHERE token_id = ?")
                .bind(revoked_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("token {token_id} not found")));
            }
            Ok(())
        }

        async fn list_tokens(&self) -> MetadataResult<Vec<TokenRow>> {
            let rows = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl BootstrapRepo for SqliteStore {
        async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>> {
            let value: Option<Option<String>> =
                sqlx::query_scalar("SELECT bootstrap_token_id FROM bootstrap_state WHERE id = 1")
                    .fetch_optional(&self.pool)
                    .await?;
            value
                .flatten()
                .filter(|id| !id.is_empty())
                .map(|id| {
                    Uuid::parse_str(&id).map_err(|e| {
                        MetadataError::Internal(format!("invalid bootstrap_token_id '{id}': {e}"))
                    })
                })
                .transpose()
        }

        async fn set_bootstrap_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO bootstrap_state (id, bootstrap_token_id)
                VALUES (1, ?)
                ON CONFLICT(id) DO UPDATE
                SET bootstrap_token_id = excluded.bootstrap_token_id
                "#,
            )
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn clear_bootstrap_token_id(&self) -> MetadataResult<()> {
            sqlx::query("UPDATE bootstrap_state SET bootstrap_token_id = NULL WHERE id = 1")
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl LeaderRepo for SqliteStore {
        async fn try_acquire_lease(
            &self,
            holder: &str,
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO leader_lease (id, holder, expires_at) VALUES (1, ?, ?)
                ON CONFLICT(id) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
                WHERE leader_lease.holder = excluded.holder OR leader_lease.expires_at < ?
                "#,
            )
            .bind(holder)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn current_leader(&self, now: OffsetDateTime) -> MetadataResult<Option<String>> {
            let holder: Option<String> = sqlx::query_scalar(
                "SELECT holder FROM leader_lease WHERE id = 1 AND expires_at >= ?",
            )
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(holder)
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS versions (
    namespace TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('node', 'dns')),
    state TEXT NOT NULL DEFAULT 'enabled',
    health_check_json TEXT,
    auto_remote_start INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_clusters_role_state ON clusters(role, state);

CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id INTEGER NOT NULL REFERENCES clusters(id),
    unique_id TEXT NOT NULL UNIQUE,
    secret TEXT NOT NULL,
    name TEXT NOT NULL,
    is_on INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 0,
    is_up INTEGER NOT NULL DEFAULT 1,
    count_up INTEGER NOT NULL DEFAULT 0,
    count_down INTEGER NOT NULL DEFAULT 0,
    status_json TEXT,
    last_seen_at TEXT,
    inactive_notified_at TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'enabled',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nodes_cluster_version ON nodes(cluster_id, version);

CREATE TABLE IF NOT EXISTS node_ip_addresses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id INTEGER NOT NULL REFERENCES nodes(id),
    ip TEXT NOT NULL,
    is_on INTEGER NOT NULL DEFAULT 1,
    can_access INTEGER NOT NULL DEFAULT 1,
    is_up INTEGER NOT NULL DEFAULT 1,
    count_up INTEGER NOT NULL DEFAULT 0,
    count_down INTEGER NOT NULL DEFAULT 0,
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_node_ip_addresses_node ON node_ip_addresses(node_id);

CREATE TABLE IF NOT EXISTS dns_domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id INTEGER NOT NULL REFERENCES clusters(id),
    name TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'enabled',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (cluster_id, name)
);
CREATE INDEX IF NOT EXISTS idx_dns_domains_cluster_version ON dns_domains(cluster_id, version);

CREATE TABLE IF NOT EXISTS dns_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain_id INTEGER NOT NULL REFERENCES dns_domains(id),
    cluster_id INTEGER NOT NULL REFERENCES clusters(id),
    name TEXT NOT NULL,
    record_type TEXT NOT NULL,
    value TEXT NOT NULL,
    ttl INTEGER NOT NULL,
    route TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'enabled',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dns_records_cluster_version ON dns_records(cluster_id, version);
CREATE INDEX IF NOT EXISTS idx_dns_records_domain ON dns_records(domain_id);

CREATE TABLE IF NOT EXISTS dns_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain_id INTEGER NOT NULL REFERENCES dns_domains(id),
    cluster_id INTEGER NOT NULL REFERENCES clusters(id),
    name TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    secret_type TEXT NOT NULL,
    secret TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'enabled',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dns_keys_cluster_version ON dns_keys(cluster_id, version);
CREATE INDEX IF NOT EXISTS idx_dns_keys_domain ON dns_keys(domain_id);

CREATE TABLE IF NOT EXISTS dns_routes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id INTEGER NOT NULL REFERENCES clusters(id),
    name TEXT NOT NULL,
    code TEXT NOT NULL,
    ranges_json TEXT NOT NULL DEFAULT '[]',
    version INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'enabled',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dns_routes_cluster_version ON dns_routes(cluster_id, version);

CREATE TABLE IF NOT EXISTS cluster_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    cluster_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL DEFAULT 0,
    kind TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending' CHECK (state IN ('pending', 'extracting')),
    generation INTEGER NOT NULL DEFAULT 0,
    claimed_by TEXT,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    UNIQUE (role, cluster_id, node_id, kind)
);
CREATE INDEX IF NOT EXISTS idx_cluster_tasks_role_state ON cluster_tasks(role, state);

CREATE TABLE IF NOT EXISTS node_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    node_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (role, node_id, kind)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    cluster_id INTEGER NOT NULL,
    node_id INTEGER NOT NULL DEFAULT 0,
    kind TEXT NOT NULL,
    level TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_cluster ON messages(cluster_id, id);

CREATE TABLE IF NOT EXISTS tokens (
    token_id BLOB PRIMARY KEY,
    token_hash TEXT NOT NULL UNIQUE,
    scopes TEXT NOT NULL,
    expires_at TEXT,
    revoked_at TEXT,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    description TEXT
);

CREATE TABLE IF NOT EXISTS bootstrap_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    bootstrap_token_id TEXT
);

CREATE TABLE IF NOT EXISTS leader_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;
