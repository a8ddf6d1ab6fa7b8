//! Version counter and change notification inside a caller's transaction.
//!
//! Every mutation that nodes must observe calls `notify_update` on the same
//! connection (normally `&mut *tx`) that performed the field change. The
//! version bump, the version stamp on the row and the cluster task upsert
//! then commit or roll back together with the mutation.
//!
//! The counter row stays locked by the incrementing transaction until it
//! commits, so versions of one namespace become visible in increasing order.

use meridian_core::EntityKind;

/// Table holding rows of a syncable kind.
pub(crate) fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Domain => "dns_domains",
        EntityKind::Record => "dns_records",
        EntityKind::Key => "dns_keys",
        EntityKind::Route => "dns_routes",
        EntityKind::Node => "nodes",
    }
}

pub mod sqlite {
    use super::table_name;
    use crate::error::{MetadataError, MetadataResult};
    use crate::metrics;
    use meridian_core::{ALL_NODES, EntityKind, NodeRole, TaskKind};
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;

    pub async fn increase_version(
        conn: &mut SqliteConnection,
        namespace: &str,
    ) -> MetadataResult<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO versions (namespace, value) VALUES (?, 1)
            ON CONFLICT(namespace) DO UPDATE SET value = versions.value + 1
            RETURNING value
            "#,
        )
        .bind(namespace)
        .fetch_one(&mut *conn)
        .await?;
        metrics::VERSION_INCREMENTS
            .with_label_values(&[namespace])
            .inc();
        Ok(value)
    }

    pub async fn enqueue_cluster_task(
        conn: &mut SqliteConnection,
        role: NodeRole,
        cluster_id: i64,
        node_id: i64,
        kind: TaskKind,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_tasks (role, cluster_id, node_id, kind, state, generation, created_at)
            VALUES (?, ?, ?, ?, 'pending', 0, ?)
            ON CONFLICT(role, cluster_id, node_id, kind)
            DO UPDATE SET generation = cluster_tasks.generation + 1
            "#,
        )
        .bind(role.as_str())
        .bind(cluster_id)
        .bind(node_id)
        .bind(kind.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        metrics::CLUSTER_TASKS_ENQUEUED
            .with_label_values(&[role.as_str(), kind.as_str()])
            .inc();
        Ok(())
    }

    /// Bump the kind's namespace, stamp the row and enqueue a cluster-wide task
    /// for the row's cluster. Returns the new version.
    pub async fn notify_update(
        conn: &mut SqliteConnection,
        kind: EntityKind,
        entity_id: i64,
    ) -> MetadataResult<i64> {
        let table = table_name(kind);
        let scope: Option<(i64, String)> = sqlx::query_as(&format!(
            "SELECT c.id, c.role FROM {table} t JOIN clusters c ON c.id = t.cluster_id WHERE t.id = ?"
        ))
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?;
        let (cluster_id, role) = scope
            .ok_or_else(|| MetadataError::NotFound(format!("{kind} {entity_id} not found")))?;
        let role = NodeRole::parse(&role)?;

        let now = OffsetDateTime::now_utc();
        let version = increase_version(&mut *conn, kind.namespace()).await?;
        sqlx::query(&format!(
            "UPDATE {table} SET version = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(version)
        .bind(now)
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;

        enqueue_cluster_task(conn, role, cluster_id, ALL_NODES, kind.task_kind(), now).await?;

        tracing::debug!(kind = %kind, entity_id, version, cluster_id, "Entity change notified");
        Ok(version)
    }
}

pub mod postgres {
    use super::table_name;
    use crate::error::{MetadataError, MetadataResult};
    use crate::metrics;
    use meridian_core::{ALL_NODES, EntityKind, NodeRole, TaskKind};
    use sqlx::PgConnection;
    use time::OffsetDateTime;

    pub async fn increase_version(conn: &mut PgConnection, namespace: &str) -> MetadataResult<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO versions (namespace, value) VALUES ($1, 1)
            ON CONFLICT(namespace) DO UPDATE SET value = versions.value + 1
            RETURNING value
            "#,
        )
        .bind(namespace)
        .fetch_one(&mut *conn)
        .await?;
        metrics::VERSION_INCREMENTS
            .with_label_values(&[namespace])
            .inc();
        Ok(value)
    }

    pub async fn enqueue_cluster_task(
        conn: &mut PgConnection,
        role: NodeRole,
        cluster_id: i64,
        node_id: i64,
        kind: TaskKind,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_tasks (role, cluster_id, node_id, kind, state, generation, created_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5)
            ON CONFLICT(role, cluster_id, node_id, kind)
            DO UPDATE SET generation = cluster_tasks.generation + 1
            "#,
        )
        .bind(role.as_str())
        .bind(cluster_id)
        .bind(node_id)
        .bind(kind.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        metrics::CLUSTER_TASKS_ENQUEUED
            .with_label_values(&[role.as_str(), kind.as_str()])
            .inc();
        Ok(())
    }

    pub async fn notify_update(
        conn: &mut PgConnection,
        kind: EntityKind,
        entity_id: i64,
    ) -> MetadataResult<i64> {
        let table = table_name(kind);
        let scope: Option<(i64, String)> = sqlx::query_as(&format!(
            "SELECT c.id, c.role FROM {table} t JOIN clusters c ON c.id = t.cluster_id WHERE t.id = $1"
        ))
        .bind(entity_id)
        .fetch_optional(&mut *conn)
        .await?;
        let (cluster_id, role) = scope
            .ok_or_else(|| MetadataError::NotFound(format!("{kind} {entity_id} not found")))?;
        let role = NodeRole::parse(&role)?;

        let now = OffsetDateTime::now_utc();
        let version = increase_version(&mut *conn, kind.namespace()).await?;
        sqlx::query(&format!(
            "UPDATE {table} SET version = $1, updated_at = $2 WHERE id = $3"
        ))
        .bind(version)
        .bind(now)
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;

        enqueue_cluster_task(conn, role, cluster_id, ALL_NODES, kind.task_kind(), now).await?;

        tracing::debug!(kind = %kind, entity_id, version, cluster_id, "Entity change notified");
        Ok(version)
    }
}
