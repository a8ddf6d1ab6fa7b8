//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::notifier::{self, table_name};
use crate::repos::{
    BootstrapRepo, ClusterRepo, ClusterTaskRepo, LeaderRepo, MessageRepo, NodeRepo, NodeTaskRepo,
    SyncRepo, TokenRepo, VersionRepo,
};
use crate::store::MetadataStore;
use async_trait::async_trait;
use meridian_core::config::PgSslMode;
use meridian_core::{
    ALL_NODES, EntityDelta, EntityKind, EntityState, NodeRole, TaskAck, TaskKind, Thresholds,
    UpDownCounter,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters,
    /// so the password can come from its own environment variable.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    async fn deltas<R>(
        &self,
        kind: EntityKind,
        cluster_id: i64,
        after: i64,
        limit: u32,
        to_delta: fn(&R) -> EntityDelta,
    ) -> MetadataResult<Vec<EntityDelta>>
    where
        R: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let table = table_name(kind);
        let rows = sqlx::query_as::<_, R>(&format!(
            "SELECT * FROM {table} WHERE cluster_id = $1 AND version > $2 ORDER BY version ASC LIMIT $3"
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
        R: for<'r> sqlx::FromRow<'r, PgRow> + Send + Unpin,
    {
        let table = table_name(kind);
        let row = sqlx::query_as::<_, R>(&format!("SELECT * FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(to_delta))
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn require_name(field: &str, value: &str) -> MetadataResult<()> {
    if value.trim().is_empty() {
        return Err(MetadataError::InvalidRequest(format!("{field} cannot be empty")));
    }
    Ok(())
}

fn not_recreatable(state: String) -> MetadataError {
    MetadataError::InvalidStateTransition {
        from: state,
        to: EntityState::Enabled.as_str().to_string(),
    }
}

fn counter_from_row(is_up: bool, count_up: i64, count_down: i64) -> UpDownCounter {
    UpDownCounter {
        is_up,
        count_up: u32::try_from(count_up).unwrap_or(u32::MAX),
        count_down: u32::try_from(count_down).unwrap_or(u32::MAX),
    }
}

async fn require_dns_cluster(conn: &mut PgConnection, cluster_id: i64) -> MetadataResult<()> {
    let cluster: Option<(String, String)> =
        sqlx::query_as("SELECT role, state FROM clusters WHERE id = $1")
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

async fn domain_cluster(conn: &mut PgConnection, domain_id: i64) -> MetadataResult<i64> {
    let domain: Option<(i64, String)> =
        sqlx::query_as("SELECT cluster_id, state FROM dns_domains WHERE id = $1")
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

async fn tombstone(conn: &mut PgConnection, kind: EntityKind, id: i64) -> MetadataResult<Option<i64>> {
    let table = table_name(kind);
    let result = sqlx::query(&format!(
        "UPDATE {table} SET state = 'disabled' WHERE id = $1 AND state = 'enabled'"
    ))
    .bind(id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Ok(None);
    }
    let version = notifier::postgres::notify_update(conn, kind, id).await?;
    Ok(Some(version))
}

async fn delete_node_tasks_in(conn: &mut PgConnection, node_id: i64) -> MetadataResult<u64> {
    let cluster_tasks = sqlx::query("DELETE FROM cluster_tasks WHERE node_id = $1")
        .bind(node_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    let node_tasks = sqlx::query("DELETE FROM node_tasks WHERE node_id = $1")
        .bind(node_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(cluster_tasks + node_tasks)
}

async fn insert_record(
    conn: &mut PgConnection,
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
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0, 'enabled', $8, $8)
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
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn insert_key(
    conn: &mut PgConnection,
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
        ) VALUES ($1, $2, $3, $4, $5, $6, 0, 'enabled', $7, $7)
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
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn insert_route(
    conn: &mut PgConnection,
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
        ) VALUES ($1, $2, $3, $4, 0, 'enabled', $5, $5)
        RETURNING id
        "#,
    )
    .bind(cluster_id)
    .bind(&fields.name)
    .bind(&fields.code)
    .bind(serde_json::to_string(&fields.ranges)?)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl VersionRepo for PostgresStore {
    async fn increase_version(&self, namespace: &str) -> MetadataResult<i64> {
        let mut tx = self.pool.begin().await?;
        let value = notifier::postgres::increase_version(&mut tx, namespace).await?;
        tx.commit().await?;
        Ok(value)
    }

    async fn current_version(&self, namespace: &str) -> MetadataResult<i64> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM versions WHERE namespace = $1")
                .bind(namespace)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.unwrap_or(0))
    }
}

#[async_trait]
impl SyncRepo for PostgresStore {
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

    async fn get_entity(&self, kind: EntityKind, id: i64) -> MetadataResult<Option<EntityDelta>> {
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
            sqlx::query_scalar(&format!("SELECT version FROM {table} WHERE id = $1 FOR UPDATE"))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Err(MetadataError::NotFound(format!("{kind} {id} not found")));
        };

        let Some(version) = tombstone(&mut tx, kind, id).await? else {
            tx.commit().await?;
            return Ok(current);
        };

        match kind {
            EntityKind::Domain => {
                for child in [EntityKind::Record, EntityKind::Key] {
                    let child_table = table_name(child);
                    let ids: Vec<i64> = sqlx::query_scalar(&format!(
                        "SELECT id FROM {child_table} WHERE domain_id = $1 AND state = 'enabled' ORDER BY id"
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
                    "SELECT * FROM dns_domains WHERE id = $1 FOR UPDATE",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("domain {id} not found")))?;
                if row.state == EntityState::Enabled.as_str() {
                    return Err(not_recreatable(row.state));
                }
                require_dns_cluster(&mut tx, row.cluster_id).await?;
                sqlx::query("UPDATE dns_domains SET state = 'enabled' WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            EntityKind::Record => {
                let row =
                    sqlx::query_as::<_, DnsRecordRow>("SELECT * FROM dns_records WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or_else(|| MetadataError::NotFound(format!("record {id} not found")))?;
                if row.state == EntityState::Enabled.as_str() {
                    return Err(not_recreatable(row.state));
                }
                let cluster_id = domain_cluster(&mut tx, row.domain_id).await?;
                insert_record(&mut tx, row.domain_id, cluster_id, &row.fields()).await?
            }
            EntityKind::Key => {
                let row = sqlx::query_as::<_, DnsKeyRow>("SELECT * FROM dns_keys WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("key {id} not found")))?;
                if row.state == EntityState::Enabled.as_str() {
                    return Err(not_recreatable(row.state));
                }
                let cluster_id = domain_cluster(&mut tx, row.domain_id).await?;
                insert_key(&mut tx, row.domain_id, cluster_id, &row.fields()).await?
            }
            EntityKind::Route => {
                let row =
                    sqlx::query_as::<_, DnsRouteRow>("SELECT * FROM dns_routes WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or_else(|| MetadataError::NotFound(format!("route {id} not found")))?;
                if row.state == EntityState::Enabled.as_str() {
                    return Err(not_recreatable(row.state));
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

        notifier::postgres::notify_update(&mut tx, kind, live_id).await?;
        tx.commit().await?;
        Ok(live_id)
    }

    async fn create_domain(&self, cluster_id: i64, name: &str) -> MetadataResult<DnsDomainRow> {
        require_name("domain name", name)?;
        let mut tx = self.pool.begin().await?;
        require_dns_cluster(&mut tx, cluster_id).await?;

        let existing = sqlx::query_as::<_, DnsDomainRow>(
            "SELECT * FROM dns_domains WHERE cluster_id = $1 AND name = $2 FOR UPDATE",
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
                sqlx::query("UPDATE dns_domains SET state = 'enabled' WHERE id = $1")
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
                    VALUES ($1, $2, 0, 'enabled', $3, $3)
                    RETURNING id
                    "#,
                )
                .bind(cluster_id)
                .bind(name)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        notifier::postgres::notify_update(&mut tx, EntityKind::Domain, id).await?;
        let row = sqlx::query_as::<_, DnsDomainRow>("SELECT * FROM dns_domains WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn get_domain(&self, domain_id: i64) -> MetadataResult<Option<DnsDomainRow>> {
        let row = sqlx::query_as::<_, DnsDomainRow>("SELECT * FROM dns_domains WHERE id = $1")
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
            "SELECT id FROM dns_domains WHERE cluster_id = $1 AND name = $2 AND id != $3",
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

        sqlx::query("UPDATE dns_domains SET name = $1 WHERE id = $2")
            .bind(name)
            .bind(domain_id)
            .execute(&mut *tx)
            .await?;
        notifier::postgres::notify_update(&mut tx, EntityKind::Domain, domain_id).await?;
        let row = sqlx::query_as::<_, DnsDomainRow>("SELECT * FROM dns_domains WHERE id = $1")
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
        notifier::postgres::notify_update(&mut tx, EntityKind::Record, id).await?;
        let row = sqlx::query_as::<_, DnsRecordRow>("SELECT * FROM dns_records WHERE id = $1")
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
            UPDATE dns_records SET name = $1, record_type = $2, value = $3, ttl = $4, route = $5
            WHERE id = $6 AND state = 'enabled'
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
        notifier::postgres::notify_update(&mut tx, EntityKind::Record, record_id).await?;
        let row = sqlx::query_as::<_, DnsRecordRow>("SELECT * FROM dns_records WHERE id = $1")
            .bind(record_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn create_key(&self, domain_id: i64, fields: &DnsKeyFields) -> MetadataResult<DnsKeyRow> {
        let mut tx = self.pool.begin().await?;
        let cluster_id = domain_cluster(&mut tx, domain_id).await?;
        let id = insert_key(&mut tx, domain_id, cluster_id, fields).await?;
        notifier::postgres::notify_update(&mut tx, EntityKind::Key, id).await?;
        let row = sqlx::query_as::<_, DnsKeyRow>("SELECT * FROM dns_keys WHERE id = $1")
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
            UPDATE dns_keys SET name = $1, algorithm = $2, secret_type = $3, secret = $4
            WHERE id = $5 AND state = 'enabled'
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
        notifier::postgres::notify_update(&mut tx, EntityKind::Key, key_id).await?;
        let row = sqlx::query_as::<_, DnsKeyRow>("SELECT * FROM dns_keys WHERE id = $1")
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
        notifier::postgres::notify_update(&mut tx, EntityKind::Route, id).await?;
        let row = sqlx::query_as::<_, DnsRouteRow>("SELECT * FROM dns_routes WHERE id = $1")
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
            UPDATE dns_routes SET name = $1, code = $2, ranges_json = $3
            WHERE id = $4 AND state = 'enabled'
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
        notifier::postgres::notify_update(&mut tx, EntityKind::Route, route_id).await?;
        let row = sqlx::query_as::<_, DnsRouteRow>("SELECT * FROM dns_routes WHERE id = $1")
            .bind(route_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }
}

#[async_trait]
impl ClusterRepo for PostgresStore {
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
            VALUES ($1, $2, 'enabled', $3, $4, $5, $5)
            RETURNING *
            "#,
        )
        .bind(&cluster.name)
        .bind(cluster.role.as_str())
        .bind(policy)
        .bind(cluster.auto_remote_start)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_cluster(&self, cluster_id: i64) -> MetadataResult<Option<ClusterRow>> {
        let row = sqlx::query_as::<_, ClusterRow>("SELECT * FROM clusters WHERE id = $1")
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
            WHERE ($1::TEXT IS NULL OR role = $1) AND ($2 = FALSE OR state = 'enabled')
            ORDER BY id
            "#,
        )
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
        let mut row =
            sqlx::query_as::<_, ClusterRow>("SELECT * FROM clusters WHERE id = $1 FOR UPDATE")
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
            UPDATE clusters SET name = $1, health_check_json = $2, auto_remote_start = $3, updated_at = $4
            WHERE id = $5
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
        let result =
            sqlx::query("UPDATE clusters SET state = 'disabled', updated_at = $1 WHERE id = $2")
                .bind(now())
                .bind(cluster_id)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!(
                "cluster {cluster_id} not found"
            )));
        }
        sqlx::query("DELETE FROM cluster_tasks WHERE cluster_id = $1")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl NodeRepo for PostgresStore {
    async fn create_node(&self, node: &NewNode) -> MetadataResult<NodeRow> {
        require_name("node name", &node.name)?;
        let mut tx = self.pool.begin().await?;

        let cluster_state: Option<String> =
            sqlx::query_scalar("SELECT state FROM clusters WHERE id = $1")
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

        let now = now();
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO nodes (
                cluster_id, unique_id, secret, name, is_on, is_active, is_up,
                count_up, count_down, version, state, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, TRUE, FALSE, TRUE, 0, 0, 0, 'enabled', $5, $5)
            ON CONFLICT (unique_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(node.cluster_id)
        .bind(&node.unique_id)
        .bind(&node.secret)
        .bind(&node.name)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(id) = id else {
            return Err(MetadataError::AlreadyExists(format!(
                "node unique id '{}' already exists",
                node.unique_id
            )));
        };

        notifier::postgres::notify_update(&mut tx, EntityKind::Node, id).await?;
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn get_node(&self, node_id: i64) -> MetadataResult<Option<NodeRow>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_node_by_unique_id(&self, unique_id: &str) -> MetadataResult<Option<NodeRow>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE unique_id = $1")
            .bind(unique_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_nodes(&self, cluster_id: i64) -> MetadataResult<Vec<NodeRow>> {
        let rows =
            sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE cluster_id = $1 ORDER BY id")
                .bind(cluster_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn list_enabled_nodes(&self, cluster_id: i64) -> MetadataResult<Vec<NodeRow>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM nodes WHERE cluster_id = $1 AND state = 'enabled' AND is_on ORDER BY id",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn disable_node(&self, node_id: i64) -> MetadataResult<i64> {
        SyncRepo::disable_entity(self, EntityKind::Node, node_id).await
    }

    async fn add_ip_address(&self, address: &NewNodeIpAddress) -> MetadataResult<NodeIpAddressRow> {
        require_name("ip", &address.ip)?;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, NodeIpAddressRow>(
            r#"
            INSERT INTO node_ip_addresses (
                node_id, ip, is_on, can_access, is_up, count_up, count_down, sort_order, created_at
            ) VALUES ($1, $2, TRUE, $3, TRUE, 0, 0, $4, $5)
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
        notifier::postgres::notify_update(&mut tx, EntityKind::Node, address.node_id).await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn list_ip_addresses(&self, node_id: i64) -> MetadataResult<Vec<NodeIpAddressRow>> {
        let rows = sqlx::query_as::<_, NodeIpAddressRow>(
            "SELECT * FROM node_ip_addresses WHERE node_id = $1 ORDER BY sort_order, id",
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
        let current: Option<(bool, i64, i64)> = sqlx::query_as(
            "SELECT is_up, count_up, count_down FROM nodes WHERE id = $1 FOR UPDATE",
        )
        .bind(node_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (is_up, count_up, count_down) =
            current.ok_or_else(|| MetadataError::NotFound(format!("node {node_id} not found")))?;

        let mut counter = counter_from_row(is_up, count_up, count_down);
        let flipped = counter.record(ok, thresholds);

        sqlx::query("UPDATE nodes SET is_up = $1, count_up = $2, count_down = $3 WHERE id = $4")
            .bind(counter.is_up)
            .bind(i64::from(counter.count_up))
            .bind(i64::from(counter.count_down))
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        if flipped.is_some() {
            notifier::postgres::notify_update(&mut tx, EntityKind::Node, node_id).await?;
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
            "SELECT node_id, is_up, count_up, count_down FROM node_ip_addresses WHERE id = $1 FOR UPDATE",
        )
        .bind(address_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (node_id, is_up, count_up, count_down) = current.ok_or_else(|| {
            MetadataError::NotFound(format!("ip address {address_id} not found"))
        })?;

        let mut counter = counter_from_row(is_up, count_up, count_down);
        let flipped = counter.record(ok, thresholds);

        sqlx::query(
            "UPDATE node_ip_addresses SET is_up = $1, count_up = $2, count_down = $3 WHERE id = $4",
        )
        .bind(counter.is_up)
        .bind(i64::from(counter.count_up))
        .bind(i64::from(counter.count_down))
        .bind(address_id)
        .execute(&mut *tx)
        .await?;
        if flipped.is_some() {
            notifier::postgres::notify_update(&mut tx, EntityKind::Node, node_id).await?;
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
            sqlx::query_scalar("SELECT is_active FROM nodes WHERE id = $1 FOR UPDATE")
                .bind(node_id)
                .fetch_optional(&mut *tx)
                .await?;
        let was_active =
            was_active.ok_or_else(|| MetadataError::NotFound(format!("node {node_id} not found")))?;

        sqlx::query(
            r#"
            UPDATE nodes
            SET status_json = COALESCE($1, status_json), last_seen_at = $2, is_active = TRUE,
                inactive_notified_at = NULL
            WHERE id = $3
            "#,
        )
        .bind(status_json)
        .bind(now)
        .bind(node_id)
        .execute(&mut *tx)
        .await?;
        if !was_active {
            notifier::postgres::notify_update(&mut tx, EntityKind::Node, node_id).await?;
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
            WHERE cluster_id = $1 AND state = 'enabled' AND is_on
              AND (last_seen_at IS NULL OR last_seen_at < $2)
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
        let result =
            sqlx::query("UPDATE nodes SET is_active = $1 WHERE id = $2 AND is_active != $1")
                .bind(is_active)
                .bind(node_id)
                .execute(&mut *tx)
                .await?;
        let changed = result.rows_affected() > 0;
        if changed {
            notifier::postgres::notify_update(&mut tx, EntityKind::Node, node_id).await?;
        }
        tx.commit().await?;
        Ok(changed)
    }

    async fn mark_inactive_notified(&self, node_id: i64, at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE nodes SET inactive_notified_at = $1 WHERE id = $2")
            .bind(at)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterTaskRepo for PostgresStore {
    async fn enqueue_cluster_task(
        &self,
        role: NodeRole,
        cluster_id: i64,
        node_id: i64,
        kind: TaskKind,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        notifier::postgres::enqueue_cluster_task(&mut tx, role, cluster_id, node_id, kind, now())
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
        // SKIP LOCKED lets concurrent claimers split the queue instead of blocking.
        let mut rows = sqlx::query_as::<_, ClusterTaskRow>(
            r#"
            UPDATE cluster_tasks
            SET state = 'extracting', claimed_by = $1, claimed_at = $2
            WHERE id IN (
                SELECT id FROM cluster_tasks
                WHERE role = $3
                  AND (state = 'pending' OR (state = 'extracting' AND claimed_at < $4))
                ORDER BY id
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(claimer)
        .bind(now)
        .bind(role.as_str())
        .bind(stale_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn fan_out_cluster_task(&self, task: &ClusterTaskRow) -> MetadataResult<FanOut> {
        let kind = task.task_kind()?;
        let mut tx = self.pool.begin().await?;

        let node_ids: Vec<i64> = if task.node_id == ALL_NODES {
            sqlx::query_scalar(
                "SELECT id FROM nodes WHERE cluster_id = $1 AND state = 'enabled' AND is_on ORDER BY id",
            )
            .bind(task.cluster_id)
            .fetch_all(&mut *tx)
            .await?
        } else {
            sqlx::query_scalar(
                "SELECT id FROM nodes WHERE id = $1 AND cluster_id = $2 AND state = 'enabled'",
            )
            .bind(task.node_id)
            .bind(task.cluster_id)
            .fetch_all(&mut *tx)
            .await?
        };

        let version: i64 = match kind.entity_kind() {
            Some(entity) => {
                sqlx::query_scalar::<_, i64>("SELECT value FROM versions WHERE namespace = $1")
                    .bind(entity.namespace())
                    .fetch_optional(&mut *tx)
                    .await?
                    .unwrap_or(0)
            }
            None => 0,
        };

        let now = now();
        // A refresh always raises the row's version, so an ack of what the
        // node saw earlier no longer matches it.
        for node_id in &node_ids {
            sqlx::query(
                r#"
                INSERT INTO node_tasks (role, node_id, kind, version, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (role, node_id, kind)
                DO UPDATE SET
                    version = GREATEST(EXCLUDED.version, node_tasks.version + 1),
                    created_at = EXCLUDED.created_at
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

        let consumed = sqlx::query("DELETE FROM cluster_tasks WHERE id = $1 AND generation = $2")
            .bind(task.id)
            .bind(task.generation)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if consumed == 0 {
            sqlx::query(
                "UPDATE cluster_tasks SET state = 'pending', claimed_by = NULL, claimed_at = NULL WHERE id = $1",
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
            WHERE id = $1 AND state = 'extracting'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_cluster_tasks(&self, role: Option<NodeRole>) -> MetadataResult<Vec<ClusterTaskRow>> {
        let rows = sqlx::query_as::<_, ClusterTaskRow>(
            "SELECT * FROM cluster_tasks WHERE ($1::TEXT IS NULL OR role = $1) ORDER BY id",
        )
        .bind(role.map(|r| r.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_cluster_tasks_for_cluster(&self, cluster_id: i64) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM cluster_tasks WHERE cluster_id = $1")
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
impl NodeTaskRepo for PostgresStore {
    async fn list_node_tasks(&self, role: NodeRole, node_id: i64) -> MetadataResult<Vec<NodeTaskRow>> {
        let rows = sqlx::query_as::<_, NodeTaskRow>(
            "SELECT * FROM node_tasks WHERE role = $1 AND node_id = $2 ORDER BY id",
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
                "DELETE FROM node_tasks WHERE id = $1 AND node_id = $2 AND version <= $3",
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
impl MessageRepo for PostgresStore {
    async fn create_message(&self, message: &NewMessage) -> MetadataResult<MessageRow> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (role, cluster_id, node_id, kind, level, subject, body, created_at, is_read)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE)
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
            WHERE ($1::BIGINT IS NULL OR cluster_id = $1)
              AND ($2::BIGINT IS NULL OR node_id = $2)
              AND ($3 = FALSE OR is_read = FALSE)
            ORDER BY id DESC
            LIMIT $4
            "#,
        )
        .bind(filter.cluster_id)
        .bind(filter.node_id)
        .bind(filter.unread_only)
        .bind(i64::from(filter.limit.unwrap_or(100)))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_message_read(&self, message_id: i64) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE messages SET is_read = TRUE WHERE id = $1")
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
impl TokenRepo for PostgresStore {
    async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (
                token_id, token_hash, scopes, expires_at,
                revoked_at, created_at, last_used_at, description
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = $1")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query("UPDATE tokens SET last_used_at = $1 WHERE token_id = $2")
            .bind(used_at)
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_token(&self, token_id: Uuid, revoked_at: OffsetDateTime) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE tokens SET revoked_at = $1 WHERE token_id = $2")
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
impl BootstrapRepo for PostgresStore {
    async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>> {
        // None: no row. Some(None): row with a NULL id.
        let value: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT bootstrap_token_id FROM bootstrap_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    async fn set_bootstrap_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bootstrap_state (id, bootstrap_token_id)
            VALUES (1, $1)
            ON CONFLICT(id) DO UPDATE
            SET bootstrap_token_id = EXCLUDED.bootstrap_token_id
            "#,
        )
        .bind(token_id)
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
impl LeaderRepo for PostgresStore {
    async fn try_acquire_lease(
        &self,
        holder: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leader_lease (id, holder, expires_at) VALUES (1, $1, $2)
            ON CONFLICT(id) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE leader_lease.holder = EXCLUDED.holder OR leader_lease.expires_at < $3
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
            "SELECT holder FROM leader_lease WHERE id = 1 AND expires_at >= $1",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(holder)
    }
}
