//! Syncable entity kinds, their version namespaces and the delta wire type.

use crate::cluster::NodeRole;
use crate::task::TaskKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace of the DNS domain version counter.
pub const NS_DOMAIN_VERSION: &str = "NS_DOMAIN_VERSION";
/// Namespace of the DNS record version counter.
pub const NS_RECORD_VERSION: &str = "NS_RECORD_VERSION";
/// Namespace of the DNS key version counter.
pub const NS_KEY_VERSION: &str = "NS_KEY_VERSION";
/// Namespace of the DNS route version counter.
pub const NS_ROUTE_VERSION: &str = "NS_ROUTE_VERSION";
/// Namespace of the node version counter.
pub const NODE_VERSION: &str = "NODE_VERSION";

/// Kinds of rows nodes pull incrementally by version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Domain,
    Record,
    Key,
    Route,
    Node,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Domain,
        EntityKind::Record,
        EntityKind::Key,
        EntityKind::Route,
        EntityKind::Node,
    ];

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "domain" | "domains" => Ok(Self::Domain),
            "record" | "records" => Ok(Self::Record),
            "key" | "keys" => Ok(Self::Key),
            "route" | "routes" => Ok(Self::Route),
            "node" | "nodes" => Ok(Self::Node),
            _ => Err(crate::Error::InvalidEntityKind(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Record => "record",
            Self::Key => "key",
            Self::Route => "route",
            Self::Node => "node",
        }
    }

    /// Version counter namespace shared by every row of this kind.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Domain => NS_DOMAIN_VERSION,
            Self::Record => NS_RECORD_VERSION,
            Self::Key => NS_KEY_VERSION,
            Self::Route => NS_ROUTE_VERSION,
            Self::Node => NODE_VERSION,
        }
    }

    /// Cluster task kind enqueued when a row of this kind changes.
    pub fn task_kind(&self) -> TaskKind {
        match self {
            Self::Domain => TaskKind::DnsDomainChanged,
            Self::Record => TaskKind::DnsRecordChanged,
            Self::Key => TaskKind::DnsKeyChanged,
            Self::Route => TaskKind::DnsRouteChanged,
            Self::Node => TaskKind::NodeStatusChanged,
        }
    }

    /// Role of the clusters this kind is distributed to, when fixed.
    /// Nodes take the role of the cluster they belong to.
    pub fn fixed_role(&self) -> Option<NodeRole> {
        match self {
            Self::Domain | Self::Record | Self::Key | Self::Route => Some(NodeRole::Dns),
            Self::Node => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a syncable row. `Disabled` is the tombstone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Enabled,
    Disabled,
}

impl EntityState {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            _ => Err(crate::Error::InvalidEntityState(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

/// One row of a `ListAfterVersion` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    pub id: i64,
    pub kind: EntityKind,
    pub version: i64,
    pub is_deleted: bool,
    /// Kind-specific fields as a JSON object.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Response body of a pull request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListAfterVersionResponse {
    pub rows: Vec<EntityDelta>,
    /// Highest version in `rows`, or the requested version when `rows` is empty.
    pub checkpoint: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_accepts_plural_path_segments() {
        assert_eq!(EntityKind::parse("domains").unwrap(), EntityKind::Domain);
        assert_eq!(EntityKind::parse("record").unwrap(), EntityKind::Record);
        assert!(EntityKind::parse("zones").is_err());
    }

    #[test]
    fn test_namespaces_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for kind in EntityKind::ALL {
            assert!(seen.insert(kind.namespace()));
        }
    }

    #[test]
    fn test_dns_kinds_have_fixed_role() {
        assert_eq!(EntityKind::Record.fixed_role(), Some(NodeRole::Dns));
        assert_eq!(EntityKind::Node.fixed_role(), None);
    }
}
