//! Swarm node and template handles

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Port the swarm manager listens on for joining nodes
pub const SWARM_MANAGER_PORT: u16 = 2377;

/// Zone suffixes nodes are spread over when none are configured
pub const DEFAULT_ZONE_SUFFIXES: &[&str] = &["a", "b", "c"];

/// Node role in the swarm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Worker node
    #[default]
    Worker,
    /// Manager node
    Manager,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::Manager => write!(f, "manager"),
        }
    }
}

/// A provisioned compute instance
///
/// Nodes are returned by a provisioner and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Instance name
    pub name: String,
    /// Node role
    pub role: NodeRole,
    /// Zone the instance was placed in
    pub zone: String,
    /// Address on the cluster subnet
    pub private_address: String,
    /// Externally routable address, when the provider assigned one
    pub external_address: Option<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Check if node is a manager
    pub fn is_manager(&self) -> bool {
        self.role == NodeRole::Manager
    }

    /// Address workers use to join this node
    pub fn join_address(&self) -> String {
        format!("{}:{}", self.private_address, SWARM_MANAGER_PORT)
    }
}

/// Blueprint worker nodes are stamped from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Template name
    pub name: String,
    /// Provider reference used when creating instances from the template
    pub self_link: String,
    /// Digest of the startup script baked into the template
    pub script_digest: String,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Externally observable result for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Position in the swarm, 0 is the manager
    pub index: usize,
    /// Instance name
    pub name: String,
    /// Externally routable address
    pub external_address: Option<String>,
}

impl NodeOutput {
    /// Output for the node at `index`
    pub fn new(index: usize, node: &Node) -> Self {
        Self {
            index,
            name: node.name.clone(),
            external_address: node.external_address.clone(),
        }
    }

    /// Build outputs for a complete swarm in index order
    pub fn from_nodes(nodes: &[Node]) -> Vec<NodeOutput> {
        nodes
            .iter()
            .enumerate()
            .map(|(index, node)| NodeOutput::new(index, node))
            .collect()
    }
}

/// Expand zone suffixes into full zone names for a region
pub fn candidate_zones<S: AsRef<str>>(region: &str, suffixes: &[S]) -> Vec<String> {
    suffixes
        .iter()
        .map(|suffix| format!("{}-{}", region, suffix.as_ref()))
        .collect()
}

/// Zone for the node at `index`, assigned round-robin
pub fn zone_for(index: usize, zones: &[String]) -> Option<&str> {
    if zones.is_empty() {
        return None;
    }
    Some(zones[index % zones.len()].as_str())
}

/// Instance name for the node at `index`
pub fn node_name(prefix: &str, index: usize) -> String {
    format!("{}-swarm-node-{}", prefix, index)
}

/// Name prefix for the worker template
pub fn template_prefix(prefix: &str) -> String {
    format!("{}-swarm-node", prefix)
}

/// Render SSH keys as instance metadata, one `user:key` per line
pub fn ssh_metadata(keys: &BTreeMap<String, String>) -> String {
    keys.iter()
        .map(|(user, key)| format!("{}:{}", user, key.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, role: NodeRole) -> Node {
        Node {
            name: name.to_string(),
            role,
            zone: "europe-west2-a".to_string(),
            private_address: "10.0.0.2".to_string(),
            external_address: Some("203.0.113.2".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_zone_round_robin() {
        let zones = candidate_zones("europe-west2", DEFAULT_ZONE_SUFFIXES);
        assert_eq!(zone_for(0, &zones), Some("europe-west2-a"));
        assert_eq!(zone_for(1, &zones), Some("europe-west2-b"));
        assert_eq!(zone_for(2, &zones), Some("europe-west2-c"));
        assert_eq!(zone_for(3, &zones), Some("europe-west2-a"));
        assert_eq!(zone_for(0, &[]), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(node_name("demo", 0), "demo-swarm-node-0");
        assert_eq!(template_prefix("demo"), "demo-swarm-node");
    }

    #[test]
    fn test_join_address() {
        let manager = node("demo-swarm-node-0", NodeRole::Manager);
        assert!(manager.is_manager());
        assert_eq!(manager.join_address(), "10.0.0.2:2377");
    }

    #[test]
    fn test_ssh_metadata() {
        let mut keys = BTreeMap::new();
        keys.insert("bob".to_string(), "ssh-ed25519 BBBB bob\n".to_string());
        keys.insert("alice".to_string(), "ssh-ed25519 AAAA alice".to_string());

        assert_eq!(
            ssh_metadata(&keys),
            "alice:ssh-ed25519 AAAA alice\nbob:ssh-ed25519 BBBB bob"
        );
        assert_eq!(ssh_metadata(&BTreeMap::new()), "");
    }

    #[test]
    fn test_outputs_keep_order() {
        let nodes = vec![
            node("demo-swarm-node-0", NodeRole::Manager),
            node("demo-swarm-node-1", NodeRole::Worker),
        ];
        let outputs = NodeOutput::from_nodes(&nodes);
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].index, 0);
        assert_eq!(outputs[0].name, "demo-swarm-node-0");
        assert_eq!(outputs[1].index, 1);
    }
}
