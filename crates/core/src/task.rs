//! Task kinds carried by cluster and node tasks.

use crate::entity::EntityKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What changed for a cluster or node. A task is a hint to pull sooner; the
/// version stored on each entity stays the source of truth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "configChanged")]
    ConfigChanged,
    #[serde(rename = "dnsDomainChanged")]
    DnsDomainChanged,
    #[serde(rename = "dnsRecordChanged")]
    DnsRecordChanged,
    #[serde(rename = "dnsKeyChanged")]
    DnsKeyChanged,
    #[serde(rename = "dnsRouteChanged")]
    DnsRouteChanged,
    #[serde(rename = "nodeStatusChanged")]
    NodeStatusChanged,
}

impl TaskKind {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "configChanged" => Ok(Self::ConfigChanged),
            "dnsDomainChanged" => Ok(Self::DnsDomainChanged),
            "dnsRecordChanged" => Ok(Self::DnsRecordChanged),
            "dnsKeyChanged" => Ok(Self::DnsKeyChanged),
            "dnsRouteChanged" => Ok(Self::DnsRouteChanged),
            "nodeStatusChanged" => Ok(Self::NodeStatusChanged),
            _ => Err(crate::Error::InvalidTaskKind(s.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigChanged => "configChanged",
            Self::DnsDomainChanged => "dnsDomainChanged",
            Self::DnsRecordChanged => "dnsRecordChanged",
            Self::DnsKeyChanged => "dnsKeyChanged",
            Self::DnsRouteChanged => "dnsRouteChanged",
            Self::NodeStatusChanged => "nodeStatusChanged",
        }
    }

    /// Entity kind whose stream this task asks a node to pull.
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            Self::ConfigChanged => None,
            Self::DnsDomainChanged => Some(EntityKind::Domain),
            Self::DnsRecordChanged => Some(EntityKind::Record),
            Self::DnsKeyChanged => Some(EntityKind::Key),
            Self::DnsRouteChanged => Some(EntityKind::Route),
            Self::NodeStatusChanged => Some(EntityKind::Node),
        }
    }
}

/// A node's acknowledgement of one node task, with the version it saw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAck {
    pub id: i64,
    pub version: i64,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
