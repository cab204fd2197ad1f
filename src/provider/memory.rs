//! In-process provider
//!
//! Backs `--dry-run` planning and the orchestrator tests. Every request is
//! recorded in call order so callers can inspect what a run would do.

use super::{
    NodeProvisioner, NodeRequest, NodeSource, SecretChannel, SecretOptions, TemplateProvisioner,
    TemplateRequest,
};
use crate::error::{DeployError, Result};
use crate::swarm::node::{Node, NodeRole, Template};
use crate::swarm::probe::{ProbeOutcome, ReadinessProbe, DEFAULT_PROBE_PORT};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Range external addresses are handed out from
const EXTERNAL_RANGE: &str = "203.0.113.0/24";

/// A request observed by the memory provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CreateNode {
        name: String,
        zone: String,
        role: NodeRole,
        template: Option<String>,
    },
    CreateTemplate {
        name: String,
        depends_on: Vec<String>,
    },
    Probe {
        address: String,
        ready: bool,
    },
    SecretExists(String),
    SecretCreate(String),
    SecretPut(String),
    SecretGet(String),
}

/// Sequential address allocator for a CIDR range
#[derive(Debug)]
struct AddressAllocator {
    range: String,
    network: u32,
    size: u32,
    next: u32,
}

impl AddressAllocator {
    fn new(cidr: &str) -> Result<Self> {
        let (base, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| DeployError::InvalidConfig(format!("Invalid subnet: {}", cidr)))?;
        let base: Ipv4Addr = base
            .parse()
            .map_err(|_| DeployError::InvalidConfig(format!("Invalid IP: {}", base)))?;
        let prefix: u32 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 30)
            .ok_or_else(|| DeployError::InvalidConfig(format!("Invalid subnet: {}", cidr)))?;

        let size = 1u32 << (32 - prefix);
        let network = u32::from(base) & !(size - 1);

        // .0 is the network, .1 the gateway
        Ok(Self {
            range: cidr.to_string(),
            network,
            size,
            next: 2,
        })
    }

    fn allocate(&mut self) -> Result<Ipv4Addr> {
        // Last address is broadcast
        if self.next >= self.size - 1 {
            return Err(DeployError::ProviderRejected(format!(
                "address range {} exhausted",
                self.range
            )));
        }
        let ip = Ipv4Addr::from(self.network + self.next);
        self.next += 1;
        Ok(ip)
    }
}

#[derive(Debug)]
struct MemoryState {
    calls: Vec<ProviderCall>,
    nodes: Vec<Node>,
    templates: Vec<Template>,
    secrets: HashMap<String, Vec<Vec<u8>>>,
    private: AddressAllocator,
    external: AddressAllocator,
    rejections: HashMap<String, String>,
    ready_after: Option<u32>,
}

/// Provider that keeps all resources in memory
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    state: Arc<RwLock<MemoryState>>,
    max_attempts: u32,
    poll_interval: Duration,
}

impl MemoryProvider {
    /// Create a provider allocating private addresses from `subnet_cidr`
    pub fn new(subnet_cidr: &str) -> Result<Self> {
        let state = MemoryState {
            calls: Vec::new(),
            nodes: Vec::new(),
            templates: Vec::new(),
            secrets: HashMap::new(),
            private: AddressAllocator::new(subnet_cidr)?,
            external: AddressAllocator::new(EXTERNAL_RANGE)?,
            rejections: HashMap::new(),
            ready_after: Some(1),
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            max_attempts: 30,
            poll_interval: Duration::from_secs(10),
        })
    }

    /// Set the simulated probe budget
    pub fn probe_budget(mut self, max_attempts: u32, poll_interval: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.poll_interval = poll_interval;
        self
    }

    /// Make nodes reachable on the given probe attempt, or never
    pub fn ready_after(&self, attempt: Option<u32>) -> Result<()> {
        self.write()?.ready_after = attempt;
        Ok(())
    }

    /// Reject any request for the named resource
    pub fn reject(&self, name: &str, message: &str) -> Result<()> {
        self.write()?
            .rejections
            .insert(name.to_string(), message.to_string());
        Ok(())
    }

    /// Requests observed so far
    pub fn calls(&self) -> Result<Vec<ProviderCall>> {
        Ok(self.read()?.calls.clone())
    }

    /// Nodes created so far
    pub fn nodes(&self) -> Result<Vec<Node>> {
        Ok(self.read()?.nodes.clone())
    }

    /// Templates created so far
    pub fn templates(&self) -> Result<Vec<Template>> {
        Ok(self.read()?.templates.clone())
    }

    /// Number of versions stored for a secret
    pub fn secret_versions(&self, name: &str) -> Result<usize> {
        Ok(self
            .read()?
            .secrets
            .get(name)
            .map(|versions| versions.len())
            .unwrap_or(0))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| DeployError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| DeployError::Lock("Failed to acquire write lock".to_string()))
    }
}

fn check_rejection(state: &MemoryState, name: &str) -> Result<()> {
    match state.rejections.get(name) {
        Some(message) => Err(DeployError::ProviderRejected(message.clone())),
        None => Ok(()),
    }
}

#[async_trait]
impl NodeProvisioner for MemoryProvider {
    async fn create_node(&self, request: &NodeRequest) -> Result<Node> {
        let mut state = self.write()?;

        let template = match &request.source {
            NodeSource::Image(_) => None,
            NodeSource::Template(template) => Some(template.self_link.clone()),
        };
        state.calls.push(ProviderCall::CreateNode {
            name: request.name.clone(),
            zone: request.zone.clone(),
            role: request.role,
            template: template.clone(),
        });

        check_rejection(&state, &request.name)?;

        if state.nodes.iter().any(|n| n.name == request.name) {
            return Err(DeployError::ProviderRejected(format!(
                "instance {} already exists",
                request.name
            )));
        }
        if let Some(link) = &template {
            if !state.templates.iter().any(|t| &t.self_link == link) {
                return Err(DeployError::ProviderRejected(format!(
                    "template {} not found",
                    link
                )));
            }
        }

        let private_address = state.private.allocate()?.to_string();
        let external_address = state.external.allocate()?.to_string();

        let node = Node {
            name: request.name.clone(),
            role: request.role,
            zone: request.zone.clone(),
            private_address,
            external_address: Some(external_address),
            created_at: Utc::now(),
        };
        state.nodes.push(node.clone());

        Ok(node)
    }
}

#[async_trait]
impl TemplateProvisioner for MemoryProvider {
    async fn create_template(&self, request: &TemplateRequest) -> Result<Template> {
        let mut state = self.write()?;
        let name = request.template_name();

        state.calls.push(ProviderCall::CreateTemplate {
            name: name.clone(),
            depends_on: request.depends_on.clone(),
        });

        check_rejection(&state, &request.name_prefix)?;

        for dependency in &request.depends_on {
            if !state.nodes.iter().any(|n| &n.name == dependency) {
                return Err(DeployError::ProviderRejected(format!(
                    "dependency {} does not exist",
                    dependency
                )));
            }
        }

        let template = Template {
            self_link: format!("regions/{}/instanceTemplates/{}", request.region, name),
            name,
            script_digest: request.script_digest.clone(),
            created_at: Utc::now(),
        };
        state.templates.push(template.clone());

        Ok(template)
    }
}

#[async_trait]
impl SecretChannel for MemoryProvider {
    async fn exists(&self, name: &str) -> Result<bool> {
        let mut state = self.write()?;
        state.calls.push(ProviderCall::SecretExists(name.to_string()));
        Ok(state.secrets.contains_key(name))
    }

    async fn create(&self, name: &str, _options: &SecretOptions) -> Result<()> {
        let mut state = self.write()?;
        state.calls.push(ProviderCall::SecretCreate(name.to_string()));
        state.secrets.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn put_version(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut state = self.write()?;
        state.calls.push(ProviderCall::SecretPut(name.to_string()));
        let versions = state
            .secrets
            .get_mut(name)
            .ok_or_else(|| DeployError::SecretChannel(format!("secret {} not found", name)))?;
        versions.push(data.to_vec());
        Ok(())
    }

    async fn get_latest_version(&self, name: &str) -> Result<Vec<u8>> {
        let mut state = self.write()?;
        state.calls.push(ProviderCall::SecretGet(name.to_string()));
        state
            .secrets
            .get(name)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| {
                DeployError::SecretChannel(format!("secret {} has no versions", name))
            })
    }
}

#[async_trait]
impl ReadinessProbe for MemoryProvider {
    async fn await_ready(&self, address: &str) -> ProbeOutcome {
        let (known, ready_after) = match self.read() {
            Ok(state) => (
                state.nodes.iter().any(|n| n.private_address == address),
                state.ready_after,
            ),
            Err(_) => (false, None),
        };

        let outcome = match ready_after {
            Some(attempt) if known && attempt >= 1 && attempt <= self.max_attempts => {
                ProbeOutcome {
                    ready: true,
                    attempts: attempt,
                    elapsed: self.poll_interval * (attempt - 1),
                }
            }
            _ => ProbeOutcome {
                ready: false,
                attempts: self.max_attempts,
                elapsed: self.poll_interval * self.max_attempts,
            },
        };

        if let Ok(mut state) = self.write() {
            state.calls.push(ProviderCall::Probe {
                address: address.to_string(),
                ready: outcome.ready,
            });
        }

        outcome
    }

    fn port(&self) -> u16 {
        DEFAULT_PROBE_PORT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InstanceSpec;

    fn instance() -> InstanceSpec {
        InstanceSpec {
            machine_type: "e2-micro".to_string(),
            image: "ubuntu-os-cloud/ubuntu-2204-lts".to_string(),
            script: "#!/bin/bash\n".to_string(),
            subnet_id: "subnet".to_string(),
            ssh_metadata: String::new(),
            identity: None,
        }
    }

    fn image_request(name: &str) -> NodeRequest {
        NodeRequest {
            name: name.to_string(),
            zone: "europe-west2-a".to_string(),
            role: NodeRole::Manager,
            source: NodeSource::Image(instance()),
        }
    }

    #[test]
    fn test_address_allocator() {
        let mut allocator = AddressAllocator::new("10.0.0.0/30").unwrap();
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(allocator.allocate().is_err());

        assert!(AddressAllocator::new("10.0.0.0").is_err());
        assert!(AddressAllocator::new("10.0.0.0/31").is_err());
    }

    #[tokio::test]
    async fn test_create_node_allocates_addresses() {
        let provider = MemoryProvider::new("10.0.0.0/24").unwrap();

        let first = provider.create_node(&image_request("a")).await.unwrap();
        let second = provider.create_node(&image_request("b")).await.unwrap();

        assert_eq!(first.private_address, "10.0.0.2");
        assert_eq!(second.private_address, "10.0.0.3");
        assert_eq!(first.external_address.as_deref(), Some("203.0.113.2"));
        assert_eq!(provider.nodes().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_and_rejected_nodes() {
        let provider = MemoryProvider::new("10.0.0.0/24").unwrap();
        provider.create_node(&image_request("a")).await.unwrap();
        assert!(provider.create_node(&image_request("a")).await.is_err());

        provider.reject("b", "quota exceeded").unwrap();
        let err = provider.create_node(&image_request("b")).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_template_requires_dependencies() {
        let provider = MemoryProvider::new("10.0.0.0/24").unwrap();
        let request = TemplateRequest {
            name_prefix: "demo-swarm-node".to_string(),
            region: "europe-west2".to_string(),
            instance: instance(),
            script_digest: "abcdef".to_string(),
            depends_on: vec!["manager".to_string()],
        };

        assert!(provider.create_template(&request).await.is_err());

        provider.create_node(&image_request("manager")).await.unwrap();
        let template = provider.create_template(&request).await.unwrap();
        assert_eq!(template.name, "demo-swarm-node-abcdef");
        assert_eq!(
            template.self_link,
            "regions/europe-west2/instanceTemplates/demo-swarm-node-abcdef"
        );
    }

    #[tokio::test]
    async fn test_secret_channel_latest_version_wins() {
        let provider = MemoryProvider::new("10.0.0.0/24").unwrap();
        let options = SecretOptions::default();

        assert!(!provider.exists("token").await.unwrap());
        assert!(provider.put_version("token", b"x").await.is_err());

        provider.create("token", &options).await.unwrap();
        provider.create("token", &options).await.unwrap();
        assert!(provider.exists("token").await.unwrap());
        assert!(provider.get_latest_version("token").await.is_err());

        provider.put_version("token", b"first").await.unwrap();
        provider.put_version("token", b"second").await.unwrap();
        assert_eq!(provider.get_latest_version("token").await.unwrap(), b"second");
        assert_eq!(provider.secret_versions("token").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_simulated_probe() {
        let provider = MemoryProvider::new("10.0.0.0/24")
            .unwrap()
            .probe_budget(5, Duration::from_secs(10));
        let node = provider.create_node(&image_request("a")).await.unwrap();

        provider.ready_after(Some(2)).unwrap();
        let outcome = provider.await_ready(&node.private_address).await;
        assert!(outcome.is_ready());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.elapsed, Duration::from_secs(10));

        provider.ready_after(Some(6)).unwrap();
        let outcome = provider.await_ready(&node.private_address).await;
        assert!(!outcome.is_ready());
        assert_eq!(outcome.attempts, 5);

        provider.ready_after(Some(1)).unwrap();
        assert!(!provider.await_ready("10.9.9.9").await.is_ready());
    }
}
