//! Cluster and node identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster identifier.
pub type ClusterId = i64;

/// Node identifier. `0` is reserved to mean "every node of the cluster".
pub type NodeId = i64;

/// Node id used by cluster-wide tasks.
pub const ALL_NODES: NodeId = 0;

/// Request headers carrying node credentials.
pub const NODE_ID_HEADER: &str = "x-node-id";
pub const NODE_SECRET_HEADER: &str = "x-node-secret";

/// Role a cluster (and every node in it) plays in the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Edge (CDN) node.
    Node,
    /// Authoritative DNS node.
    Dns,
}

impl NodeRole {
    /// Every supported role, in extraction order.
    pub const ALL: [NodeRole; 2] = [NodeRole::Node, NodeRole::Dns];

    /// Parse from the persisted string form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "node" => Ok(Self::Node),
            "dns" => Ok(Self::Dns),
            _ => Err(crate::Error::InvalidRole(s.to_string())),
        }
    }

    /// Get the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Dns => "dns",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key for per-(cluster, node) in-memory state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
}

impl NodeKey {
    pub fn new(cluster_id: ClusterId, node_id: NodeId) -> Self {
        Self {
            cluster_id,
            node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(NodeRole::parse("node").unwrap(), NodeRole::Node);
        assert_eq!(NodeRole::parse("dns").unwrap(), NodeRole::Dns);
        assert!(NodeRole::parse("edge").is_err());
    }

    #[test]
    fn test_node_key_distinguishes_clusters() {
        assert_ne!(NodeKey::new(1, 12), NodeKey::new(11, 2));
    }
}
