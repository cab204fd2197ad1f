//! Cloud collaborators the orchestrator drives
//!
//! The orchestrator only talks to these traits. Provisioning errors are
//! returned as-is and never retried here; retry policy belongs to the
//! backend.

pub mod gcloud;
pub mod memory;

use crate::error::Result;
use crate::swarm::node::{Node, NodeRole, Template};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use gcloud::GcloudProvider;
pub use memory::{MemoryProvider, ProviderCall};

/// Everything needed to boot an instance from an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Compute shape
    pub machine_type: String,
    /// Boot image reference
    pub image: String,
    /// Startup script
    pub script: String,
    /// Subnet handle from the network collaborator
    pub subnet_id: String,
    /// `user:key` lines
    pub ssh_metadata: String,
    /// Compute identity used to reach the secret store
    pub identity: Option<String>,
}

/// Where a node's configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSource {
    /// Boot directly from an image
    Image(InstanceSpec),
    /// Stamp from a template
    Template(Template),
}

/// Request to create one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    /// Instance name
    pub name: String,
    /// Zone
    pub zone: String,
    /// Role the node will take in the swarm
    pub role: NodeRole,
    /// Configuration source
    pub source: NodeSource,
}

/// Request to create the worker template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRequest {
    /// Template name prefix
    pub name_prefix: String,
    /// Region
    pub region: String,
    /// Instance configuration baked into the template
    pub instance: InstanceSpec,
    /// Digest of `instance.script`
    pub script_digest: String,
    /// Resources that must exist before the template
    pub depends_on: Vec<String>,
}

impl TemplateRequest {
    /// Content-addressed template name
    pub fn template_name(&self) -> String {
        let short = self
            .script_digest
            .get(..12)
            .unwrap_or(&self.script_digest);
        format!("{}-{}", self.name_prefix, short)
    }
}

/// Options for creating a secret entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretOptions {
    /// Replication policy
    pub replication: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

impl Default for SecretOptions {
    fn default() -> Self {
        Self {
            replication: "automatic".to_string(),
            labels: BTreeMap::new(),
        }
    }
}

/// Creates compute nodes
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Create a node and resolve its addresses
    async fn create_node(&self, request: &NodeRequest) -> Result<Node>;
}

/// Creates node templates
#[async_trait]
pub trait TemplateProvisioner: Send + Sync {
    /// Create a template
    async fn create_template(&self, request: &TemplateRequest) -> Result<Template>;
}

/// Versioned secret store used to hand the join token to workers
///
/// The manager's startup script is the single writer; worker scripts read
/// the latest version. The orchestrator itself only checks existence.
#[async_trait]
pub trait SecretChannel: Send + Sync {
    /// Check whether the secret entry exists
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Create the entry if it is absent
    async fn create(&self, name: &str, options: &SecretOptions) -> Result<()>;

    /// Add a new version
    async fn put_version(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Read the most recent version
    async fn get_latest_version(&self, name: &str) -> Result<Vec<u8>>;
}

/// The collaborators an orchestration run needs
#[derive(Clone)]
pub struct Providers {
    pub nodes: Arc<dyn NodeProvisioner>,
    pub templates: Arc<dyn TemplateProvisioner>,
    pub secrets: Arc<dyn SecretChannel>,
}

impl Providers {
    /// Use one backend for every collaborator
    pub fn from_backend<P>(backend: Arc<P>) -> Self
    where
        P: NodeProvisioner + TemplateProvisioner + SecretChannel + 'static,
    {
        Self {
            nodes: backend.clone(),
            templates: backend.clone(),
            secrets: backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_name_uses_digest_prefix() {
        let request = TemplateRequest {
            name_prefix: "demo-swarm-node".to_string(),
            region: "europe-west2".to_string(),
            instance: InstanceSpec {
                machine_type: "e2-micro".to_string(),
                image: "ubuntu-os-cloud/ubuntu-2204-lts".to_string(),
                script: "#!/bin/bash\n".to_string(),
                subnet_id: "subnet".to_string(),
                ssh_metadata: String::new(),
                identity: None,
            },
            script_digest: "0123456789abcdef0123".to_string(),
            depends_on: vec!["demo-swarm-node-0".to_string()],
        };
        assert_eq!(request.template_name(), "demo-swarm-node-0123456789ab");

        let mut short = request.clone();
        short.script_digest = "abc".to_string();
        assert_eq!(short.template_name(), "demo-swarm-node-abc");

        // Byte 12 falls inside a multi-byte character
        let mut wide = request;
        wide.script_digest = "aééééééé".to_string();
        assert_eq!(wide.template_name(), "demo-swarm-node-aééééééé");
    }
}
