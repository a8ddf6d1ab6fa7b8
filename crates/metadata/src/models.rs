//! Database models mapping to the metadata schema.

use meridian_core::{EntityDelta, EntityKind, EntityState, HealthCheckPolicy, NodeRole, TaskKind};
use serde_json::json;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Clusters, nodes and addresses
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct ClusterRow {
    pub id: i64,
    pub name: String,
    pub role: String,
    pub state: String,
    /// Per-cluster probe policy; the server default applies when absent.
    pub health_check_json: Option<String>,
    pub auto_remote_start: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ClusterRow {
    pub fn role(&self) -> meridian_core::Result<NodeRole> {
        NodeRole::parse(&self.role)
    }

    pub fn is_enabled(&self) -> bool {
        self.state == EntityState::Enabled.as_str()
    }

    /// Stored policy, if any. An unparsable policy is treated as absent.
    pub fn health_check_policy(&self) -> Option<HealthCheckPolicy> {
        let raw = self.health_check_json.as_deref()?;
        match serde_json::from_str::<HealthCheckPolicy>(raw) {
            Ok(policy) => Some(policy),
            Err(e) => {
                tracing::warn!(cluster_id = self.id, error = %e, "Ignoring invalid health check policy");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCluster {
    pub name: String,
    pub role: NodeRole,
    pub health_check: Option<HealthCheckPolicy>,
    pub auto_remote_start: bool,
}

/// Partial update of a cluster. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ClusterUpdate {
    pub name: Option<String>,
    /// `Some(None)` clears the stored policy.
    pub health_check: Option<Option<HealthCheckPolicy>>,
    pub auto_remote_start: Option<bool>,
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub id: i64,
    pub cluster_id: i64,
    pub unique_id: String,
    pub secret: String,
    pub name: String,
    pub is_on: bool,
    pub is_active: bool,
    pub is_up: bool,
    pub count_up: i64,
    pub count_down: i64,
    pub status_json: Option<String>,
    pub last_seen_at: Option<OffsetDateTime>,
    pub inactive_notified_at: Option<OffsetDateTime>,
    pub version: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl NodeRow {
    pub fn is_enabled(&self) -> bool {
        self.state == EntityState::Enabled.as_str()
    }

    pub fn to_delta(&self) -> EntityDelta {
        let status = self
            .status_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
            .unwrap_or(serde_json::Value::Null);
        EntityDelta {
            id: self.id,
            kind: EntityKind::Node,
            version: self.version,
            is_deleted: !self.is_enabled(),
            data: json!({
                "cluster_id": self.cluster_id,
                "unique_id": self.unique_id,
                "name": self.name,
                "is_on": self.is_on,
                "is_up": self.is_up,
                "is_active": self.is_active,
                "status": status,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub cluster_id: i64,
    pub name: String,
    pub unique_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeIpAddressRow {
    pub id: i64,
    pub node_id: i64,
    pub ip: String,
    pub is_on: bool,
    /// Reachable from the control plane; only such addresses are probed.
    pub can_access: bool,
    pub is_up: bool,
    pub count_up: i64,
    pub count_down: i64,
    pub sort_order: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewNodeIpAddress {
    pub node_id: i64,
    pub ip: String,
    pub can_access: bool,
    pub sort_order: i64,
}

// =============================================================================
// Syncable DNS entities
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct DnsDomainRow {
    pub id: i64,
    pub cluster_id: i64,
    pub name: String,
    pub version: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl DnsDomainRow {
    pub fn to_delta(&self) -> EntityDelta {
        EntityDelta {
            id: self.id,
            kind: EntityKind::Domain,
            version: self.version,
            is_deleted: self.state != EntityState::Enabled.as_str(),
            data: json!({
                "cluster_id": self.cluster_id,
                "name": self.name,
            }),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DnsRecordRow {
    pub id: i64,
    pub domain_id: i64,
    pub cluster_id: i64,
    pub name: String,
    pub record_type: String,
    pub value: String,
    pub ttl: i64,
    pub route: Option<String>,
    pub version: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl DnsRecordRow {
    pub fn to_delta(&self) -> EntityDelta {
        EntityDelta {
            id: self.id,
            kind: EntityKind::Record,
            version: self.version,
            is_deleted: self.state != EntityState::Enabled.as_str(),
            data: json!({
                "domain_id": self.domain_id,
                "name": self.name,
                "type": self.record_type,
                "value": self.value,
                "ttl": self.ttl,
                "route": self.route,
            }),
        }
    }

    pub fn fields(&self) -> DnsRecordFields {
        DnsRecordFields {
            name: self.name.clone(),
            record_type: self.record_type.clone(),
            value: self.value.clone(),
            ttl: self.ttl,
            route: self.route.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DnsRecordFields {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    #[serde(default)]
    pub route: Option<String>,
}

fn default_ttl() -> i64 {
    600
}

#[derive(Debug, Clone, FromRow)]
pub struct DnsKeyRow {
    pub id: i64,
    pub domain_id: i64,
    pub cluster_id: i64,
    pub name: String,
    pub algorithm: String,
    pub secret_type: String,
    pub secret: String,
    pub version: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl DnsKeyRow {
    pub fn to_delta(&self) -> EntityDelta {
        EntityDelta {
            id: self.id,
            kind: EntityKind::Key,
            version: self.version,
            is_deleted: self.state != EntityState::Enabled.as_str(),
            data: json!({
                "domain_id": self.domain_id,
                "name": self.name,
                "algorithm": self.algorithm,
                "secret_type": self.secret_type,
                "secret": self.secret,
            }),
        }
    }

    pub fn fields(&self) -> DnsKeyFields {
        DnsKeyFields {
            name: self.name.clone(),
            algorithm: self.algorithm.clone(),
            secret_type: self.secret_type.clone(),
            secret: self.secret.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DnsKeyFields {
    pub name: String,
    pub algorithm: String,
    pub secret_type: String,
    pub secret: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct DnsRouteRow {
    pub id: i64,
    pub cluster_id: i64,
    pub name: String,
    pub code: String,
    /// JSON array of address ranges.
    pub ranges_json: String,
    pub version: i64,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl DnsRouteRow {
    pub fn ranges(&self) -> Vec<String> {
        serde_json::from_str(&self.ranges_json).unwrap_or_default()
    }

    pub fn to_delta(&self) -> EntityDelta {
        EntityDelta {
            id: self.id,
            kind: EntityKind::Route,
            version: self.version,
            is_deleted: self.state != EntityState::Enabled.as_str(),
            data: json!({
                "cluster_id": self.cluster_id,
                "name": self.name,
                "code": self.code,
                "ranges": self.ranges(),
            }),
        }
    }

    pub fn fields(&self) -> DnsRouteFields {
        DnsRouteFields {
            name: self.name.clone(),
            code: self.code.clone(),
            ranges: self.ranges(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DnsRouteFields {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub ranges: Vec<String>,
}

// =============================================================================
// Task queues
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct ClusterTaskRow {
    pub id: i64,
    pub role: String,
    pub cluster_id: i64,
    /// Zero for cluster-wide tasks.
    pub node_id: i64,
    pub kind: String,
    /// "pending" or "extracting".
    pub state: String,
    /// Bumped by every re-notification; a claim is only consumed if it is
    /// unchanged when fan-out completes.
    pub generation: i64,
    pub claimed_by: Option<String>,
    pub created_at: OffsetDateTime,
    pub claimed_at: Option<OffsetDateTime>,
}

impl ClusterTaskRow {
    pub fn role(&self) -> meridian_core::Result<NodeRole> {
        NodeRole::parse(&self.role)
    }

    pub fn task_kind(&self) -> meridian_core::Result<TaskKind> {
        TaskKind::parse(&self.kind)
    }
}

/// Result of expanding one cluster task.
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    /// Nodes that received (or refreshed) a node task.
    pub node_ids: Vec<i64>,
    /// False when the task was re-notified mid-extraction and went back to pending.
    pub completed: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct NodeTaskRow {
    pub id: i64,
    pub role: String,
    pub node_id: i64,
    pub kind: String,
    /// Namespace version at fan-out time.
    pub version: i64,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: i64,
    pub role: String,
    pub cluster_id: i64,
    pub node_id: i64,
    pub kind: String,
    pub level: String,
    pub subject: String,
    pub body: String,
    pub created_at: OffsetDateTime,
    pub is_read: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: NodeRole,
    pub cluster_id: i64,
    pub node_id: i64,
    pub kind: meridian_core::MessageKind,
    pub level: meridian_core::MessageLevel,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub cluster_id: Option<i64>,
    pub node_id: Option<i64>,
    pub unread_only: bool,
    pub limit: Option<u32>,
}

// =============================================================================
// Tokens
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub token_hash: String,
    /// JSON array of scope strings.
    pub scopes: String,
    pub expires_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub description: Option<String>,
}
