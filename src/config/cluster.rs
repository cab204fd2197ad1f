//! Deployment configuration and the resolved cluster spec

use crate::error::{DeployError, Result};
use crate::swarm::node::{candidate_zones, ssh_metadata, DEFAULT_ZONE_SUFFIXES};
use crate::swarm::probe::{ProbeConfig, DEFAULT_PROBE_PORT};
use crate::swarm::script::AddressPool;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Deployment file model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentConfig {
    /// Prefix for every created resource
    pub name: Option<String>,
    /// Secret holding the swarm join token
    pub docker_token_secret_name: Option<String>,
    /// Whether the secret is created and owned outside this deployment
    pub docker_token_secret_user_managed: bool,
    /// Deployment region
    pub region: String,
    /// Compute shape
    pub machine_type: String,
    /// Boot image, `project/family` or a full image reference
    pub instance_image_id: String,
    /// Number of nodes in the swarm, manager included
    pub instance_count: u32,
    /// Subnet handle from the network setup
    pub subnet_id: Option<String>,
    /// SSH public keys, `username: key`
    pub ssh_pub_keys: BTreeMap<String, String>,
    /// Compute identity for the nodes; the provider default when unset
    pub compute_sa: Option<String>,
    /// Zone suffixes nodes are spread across
    pub zones: Vec<String>,
    /// Create workers concurrently
    pub parallel_workers: bool,
    /// Manager readiness probing
    pub readiness: ReadinessSettings,
    /// Swarm initialisation
    pub swarm: SwarmSettings,
    /// Provider backend
    pub provider: ProviderSettings,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            name: None,
            docker_token_secret_name: None,
            docker_token_secret_user_managed: false,
            region: "europe-west2".to_string(),
            machine_type: "e2-micro".to_string(),
            instance_image_id: "ubuntu-os-cloud/ubuntu-2204-lts".to_string(),
            instance_count: 3,
            subnet_id: None,
            ssh_pub_keys: BTreeMap::new(),
            compute_sa: None,
            zones: DEFAULT_ZONE_SUFFIXES.iter().map(|z| z.to_string()).collect(),
            parallel_workers: true,
            readiness: ReadinessSettings::default(),
            swarm: SwarmSettings::default(),
            provider: ProviderSettings::default(),
        }
    }
}

/// Readiness probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSettings {
    /// Port probed on the manager
    pub port: u16,
    /// Extra ports that must accept as well, e.g. 2377
    pub confirm_ports: Vec<u16>,
    /// Seconds between attempts
    pub poll_interval_secs: u64,
    /// Attempt budget
    pub max_attempts: u32,
    /// Seconds before a single connect gives up
    pub connect_timeout_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROBE_PORT,
            confirm_ports: Vec::new(),
            poll_interval_secs: 10,
            max_attempts: 30,
            connect_timeout_secs: 5,
        }
    }
}

/// Swarm initialisation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwarmSettings {
    /// Default address pool for overlay networks
    pub address_pool: String,
    /// Mask length of each overlay network
    pub subnet_size: u8,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        let pool = AddressPool::default();
        Self {
            address_pool: pool.cidr,
            subnet_size: pool.mask_length,
        }
    }
}

/// Provider backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    /// Path or name of the gcloud binary
    pub gcloud_binary: String,
    /// Project passed to gcloud; the active configuration when unset
    pub project: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            gcloud_binary: "gcloud".to_string(),
            project: None,
        }
    }
}

/// Immutable inputs of one orchestration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub name: String,
    pub region: String,
    pub machine_type: String,
    pub instance_image_id: String,
    pub instance_count: u32,
    pub subnet_id: String,
    pub ssh_pub_keys: BTreeMap<String, String>,
    pub secret_name: String,
    pub secret_user_managed: bool,
    pub compute_identity: Option<String>,
    /// Full zone names, index 0 hosts the manager
    pub zones: Vec<String>,
    pub parallel_workers: bool,
    pub probe: ProbeConfig,
    pub address_pool: AddressPool,
}

impl ClusterSpec {
    /// Users added to the docker group on every node
    pub fn local_users(&self) -> Vec<String> {
        self.ssh_pub_keys.keys().cloned().collect()
    }

    /// SSH keys rendered as instance metadata
    pub fn ssh_metadata(&self) -> String {
        ssh_metadata(&self.ssh_pub_keys)
    }

    /// Number of workers to stamp from the template
    pub fn worker_count(&self) -> u32 {
        self.instance_count.saturating_sub(1)
    }
}

fn pattern(expr: &str) -> Result<Regex> {
    Regex::new(expr).map_err(|e| DeployError::Internal(format!("invalid pattern: {}", e)))
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DeployError::InvalidConfig(format!("'{}' is required", field)))
}

fn non_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DeployError::InvalidConfig(format!(
            "'{}' must not be empty",
            field
        )));
    }
    Ok(())
}

impl DeploymentConfig {
    /// Validate the configuration and resolve it into a cluster spec
    pub fn resolve(&self) -> Result<ClusterSpec> {
        let name = required(&self.name, "name")?;
        let resource_name = pattern(r"^[a-z]([-a-z0-9]*[a-z0-9])?$")?;
        if !resource_name.is_match(&name) {
            return Err(DeployError::InvalidConfig(format!(
                "name '{}' must be lowercase letters, digits and hyphens, starting with a letter",
                name
            )));
        }

        let secret_name = required(&self.docker_token_secret_name, "docker_token_secret_name")?;
        if !pattern(r"^[A-Za-z0-9_-]+$")?.is_match(&secret_name) {
            return Err(DeployError::InvalidConfig(format!(
                "secret name '{}' may only contain letters, digits, '-' and '_'",
                secret_name
            )));
        }

        let subnet_id = required(&self.subnet_id, "subnet_id")?;
        non_empty(&self.region, "region")?;
        non_empty(&self.machine_type, "machine_type")?;
        non_empty(&self.instance_image_id, "instance_image_id")?;

        if self.instance_count < 1 {
            return Err(DeployError::InvalidConfig(
                "instance_count must be at least 1".to_string(),
            ));
        }
        if self.zones.is_empty() {
            return Err(DeployError::InvalidConfig(
                "at least one zone is required".to_string(),
            ));
        }
        if self.readiness.max_attempts < 1 {
            return Err(DeployError::InvalidConfig(
                "readiness.max_attempts must be at least 1".to_string(),
            ));
        }

        let user_name = pattern(r"^[a-z_][a-z0-9_-]*$")?;
        for (user, key) in &self.ssh_pub_keys {
            if !user_name.is_match(user) {
                return Err(DeployError::InvalidConfig(format!(
                    "invalid ssh user name '{}'",
                    user
                )));
            }
            non_empty(key, &format!("ssh_pub_keys.{}", user))?;
        }

        let compute_identity = self
            .compute_sa
            .as_deref()
            .map(str::trim)
            .filter(|sa| !sa.is_empty())
            .map(str::to_string);

        Ok(ClusterSpec {
            name,
            region: self.region.clone(),
            machine_type: self.machine_type.clone(),
            instance_image_id: self.instance_image_id.clone(),
            instance_count: self.instance_count,
            subnet_id,
            ssh_pub_keys: self.ssh_pub_keys.clone(),
            secret_name,
            secret_user_managed: self.docker_token_secret_user_managed,
            compute_identity,
            zones: candidate_zones(&self.region, &self.zones),
            parallel_workers: self.parallel_workers,
            probe: ProbeConfig {
                port: self.readiness.port,
                confirm_ports: self.readiness.confirm_ports.clone(),
                poll_interval: Duration::from_secs(self.readiness.poll_interval_secs),
                max_attempts: self.readiness.max_attempts,
                connect_timeout: Duration::from_secs(self.readiness.connect_timeout_secs),
            },
            address_pool: AddressPool {
                cidr: self.swarm.address_pool.clone(),
                mask_length: self.swarm.subnet_size,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> DeploymentConfig {
        DeploymentConfig {
            name: Some("demo".to_string()),
            docker_token_secret_name: Some("swarm-token".to_string()),
            subnet_id: Some("projects/p/regions/europe-west2/subnetworks/demo".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let spec = minimal().resolve().unwrap();
        assert_eq!(spec.region, "europe-west2");
        assert_eq!(spec.machine_type, "e2-micro");
        assert_eq!(spec.instance_image_id, "ubuntu-os-cloud/ubuntu-2204-lts");
        assert_eq!(spec.instance_count, 3);
        assert_eq!(spec.worker_count(), 2);
        assert_eq!(
            spec.zones,
            vec!["europe-west2-a", "europe-west2-b", "europe-west2-c"]
        );
        assert_eq!(spec.probe.port, 22);
        assert_eq!(spec.probe.max_attempts, 30);
        assert_eq!(spec.probe.poll_interval, Duration::from_secs(10));
        assert!(!spec.secret_user_managed);
        assert!(spec.compute_identity.is_none());
    }

    #[test]
    fn test_required_fields() {
        let mut config = minimal();
        config.name = None;
        assert!(config.resolve().is_err());

        let mut config = minimal();
        config.docker_token_secret_name = Some("  ".to_string());
        assert!(config.resolve().is_err());

        let mut config = minimal();
        config.subnet_id = None;
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = minimal();
        config.name = Some("Demo_Cluster".to_string());
        assert!(config.resolve().is_err());

        let mut config = minimal();
        config.instance_count = 0;
        assert!(config.resolve().is_err());

        let mut config = minimal();
        config.zones.clear();
        assert!(config.resolve().is_err());

        let mut config = minimal();
        config.readiness.max_attempts = 0;
        assert!(config.resolve().is_err());

        let mut config = minimal();
        config
            .ssh_pub_keys
            .insert("root;reboot".to_string(), "ssh-ed25519 AAAA".to_string());
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_local_users_from_keys() {
        let mut config = minimal();
        config
            .ssh_pub_keys
            .insert("bob".to_string(), "ssh-ed25519 BBBB".to_string());
        config
            .ssh_pub_keys
            .insert("alice".to_string(), "ssh-ed25519 AAAA".to_string());

        let spec = config.resolve().unwrap();
        assert_eq!(spec.local_users(), vec!["alice", "bob"]);
        assert_eq!(
            spec.ssh_metadata(),
            "alice:ssh-ed25519 AAAA\nbob:ssh-ed25519 BBBB"
        );
    }
}
