//! Bootstrap script rendering
//!
//! The startup scripts are the protocol between the orchestrator and the
//! nodes it creates. The manager initialises the swarm and publishes its
//! join token to the secret store; workers read the latest token version
//! and join the manager on port 2377. The secret entry is written once by
//! the manager and read by every worker, so the only synchronisation is
//! the ordering of resource creation: the worker template is created after
//! the manager is confirmed ready.
//!
//! Rendering is a pure function of its inputs.

use super::node::{NodeRole, SWARM_MANAGER_PORT};
use crate::error::{DeployError, Result};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Address pool handed to `docker swarm init`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    /// Pool CIDR
    pub cidr: String,
    /// Mask length of each network carved from the pool
    pub mask_length: u8,
}

impl Default for AddressPool {
    fn default() -> Self {
        Self {
            cidr: "10.20.0.0/16".to_string(),
            mask_length: 24,
        }
    }
}

/// Inputs for rendering a bootstrap script
#[derive(Debug, Clone)]
pub struct ScriptParams {
    /// Role the script bootstraps
    pub role: NodeRole,
    /// Secret entry holding the join token
    pub secret_name: String,
    /// Whether the secret entry is managed outside the deployment
    pub secret_user_managed: bool,
    /// Manager address, required for workers and ignored for managers
    pub manager_private_address: Option<String>,
    /// Local users added to the docker group
    pub local_users: Vec<String>,
    /// Swarm address pool
    pub address_pool: AddressPool,
}

impl ScriptParams {
    /// Parameters for the manager script
    pub fn manager(secret_name: &str, secret_user_managed: bool, local_users: Vec<String>) -> Self {
        Self {
            role: NodeRole::Manager,
            secret_name: secret_name.to_string(),
            secret_user_managed,
            manager_private_address: None,
            local_users,
            address_pool: AddressPool::default(),
        }
    }

    /// Parameters for the worker script
    pub fn worker(secret_name: &str, manager_private_address: &str, local_users: Vec<String>) -> Self {
        Self {
            role: NodeRole::Worker,
            secret_name: secret_name.to_string(),
            secret_user_managed: false,
            manager_private_address: Some(manager_private_address.to_string()),
            local_users,
            address_pool: AddressPool::default(),
        }
    }

    /// Set the swarm address pool
    pub fn address_pool(mut self, pool: AddressPool) -> Self {
        self.address_pool = pool;
        self
    }
}

/// A rendered startup script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapScript {
    role: NodeRole,
    text: String,
}

impl BootstrapScript {
    /// Role the script bootstraps
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Script text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Hex SHA-256 of the script text
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Consume into the script text
    pub fn into_text(self) -> String {
        self.text
    }
}

const RUNTIME_INSTALL: &str = "apt update && apt -y install docker.io";

/// Render the startup script for a role
pub fn render(params: &ScriptParams) -> Result<BootstrapScript> {
    validate_secret_name(&params.secret_name)?;
    for user in &params.local_users {
        validate_user_name(user)?;
    }

    let mut lines = vec![
        "#!/bin/bash".to_string(),
        format!("# swarm bootstrap: {}", params.role),
        RUNTIME_INSTALL.to_string(),
    ];

    match params.role {
        NodeRole::Manager => {
            validate_pool(&params.address_pool)?;
            lines.extend(manager_steps(params));
        }
        NodeRole::Worker => {
            let address = params
                .manager_private_address
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| {
                    DeployError::ScriptValidation(
                        "worker script requires the manager private address".to_string(),
                    )
                })?;
            validate_address(address)?;
            lines.push(format!(
                "docker swarm join --token \"$(gcloud secrets versions access latest --secret={})\" {}:{}",
                params.secret_name, address, SWARM_MANAGER_PORT
            ));
        }
    }

    lines.push(docker_group_step(&params.local_users));

    let mut text = lines.join("\n");
    text.push('\n');

    Ok(BootstrapScript {
        role: params.role,
        text,
    })
}

fn manager_steps(params: &ScriptParams) -> Vec<String> {
    let secret = &params.secret_name;
    let mut steps = Vec::new();

    if params.secret_user_managed {
        steps.push(format!("# secret {} is user-managed", secret));
    } else {
        steps.push(format!(
            "if ! gcloud secrets describe {} >/dev/null 2>&1; then",
            secret
        ));
        steps.push(format!(
            "  gcloud secrets create {} --replication-policy=automatic",
            secret
        ));
        steps.push("fi".to_string());
    }

    steps.push(format!(
        "docker swarm init --default-addr-pool {} --default-addr-pool-mask-length {}",
        params.address_pool.cidr, params.address_pool.mask_length
    ));
    steps.push(format!(
        "docker swarm join-token manager -q | gcloud secrets versions add {} --data-file=-",
        secret
    ));
    steps
}

/// Group grant step; rendered as a no-op when there are no users
fn docker_group_step(users: &[String]) -> String {
    if users.is_empty() {
        return ": # no local users to add to the docker group".to_string();
    }
    format!(
        "for user in {}; do sudo usermod -a -G docker \"$user\"; done",
        users.join(" ")
    )
}

fn validate_secret_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(DeployError::ScriptValidation(format!(
            "invalid secret name '{}'",
            name
        )));
    }
    Ok(())
}

fn validate_user_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_lowercase() || first == '_')
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        }
        None => false,
    };
    if !valid {
        return Err(DeployError::ScriptValidation(format!(
            "invalid local user name '{}'",
            name
        )));
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<()> {
    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let hostname = address
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !hostname {
        return Err(DeployError::ScriptValidation(format!(
            "invalid manager address '{}'",
            address
        )));
    }
    Ok(())
}

fn validate_pool(pool: &AddressPool) -> Result<()> {
    let (base, prefix) = pool.cidr.split_once('/').ok_or_else(|| {
        DeployError::ScriptValidation(format!("invalid address pool '{}'", pool.cidr))
    })?;
    let prefix: u8 = prefix.parse().map_err(|_| {
        DeployError::ScriptValidation(format!("invalid address pool '{}'", pool.cidr))
    })?;
    if base.parse::<std::net::Ipv4Addr>().is_err() || prefix > 32 {
        return Err(DeployError::ScriptValidation(format!(
            "invalid address pool '{}'",
            pool.cidr
        )));
    }
    if pool.mask_length < prefix || pool.mask_length > 32 {
        return Err(DeployError::ScriptValidation(format!(
            "mask length {} does not fit pool {}",
            pool.mask_length, pool.cidr
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<String> {
        vec!["alice".to_string(), "deployer".to_string()]
    }

    #[test]
    fn test_manager_script() {
        let script = render(&ScriptParams::manager("swarm-token", false, users())).unwrap();
        let text = script.text();

        assert_eq!(script.role(), NodeRole::Manager);
        assert!(text.starts_with("#!/bin/bash\n"));
        assert!(text.contains("apt update && apt -y install docker.io"));
        assert!(text.contains("if ! gcloud secrets describe swarm-token >/dev/null 2>&1; then"));
        assert!(text.contains("gcloud secrets create swarm-token --replication-policy=automatic"));
        assert!(text.contains(
            "docker swarm init --default-addr-pool 10.20.0.0/16 --default-addr-pool-mask-length 24"
        ));
        assert!(text.contains(
            "docker swarm join-token manager -q | gcloud secrets versions add swarm-token --data-file=-"
        ));
        assert!(text.contains(
            "for user in alice deployer; do sudo usermod -a -G docker \"$user\"; done"
        ));

        // Secret must exist before the token is written
        let create = text.find("gcloud secrets create").unwrap();
        let init = text.find("docker swarm init").unwrap();
        let write = text.find("gcloud secrets versions add").unwrap();
        assert!(create < init && init < write);
    }

    #[test]
    fn test_manager_user_managed_secret() {
        let script = render(&ScriptParams::manager("swarm-token", true, users())).unwrap();
        assert!(!script.text().contains("gcloud secrets create"));
        assert!(!script.text().contains("gcloud secrets describe"));
        assert!(script.text().contains("gcloud secrets versions add swarm-token"));
    }

    #[test]
    fn test_manager_ignores_address() {
        let mut params = ScriptParams::manager("swarm-token", false, users());
        let plain = render(&params).unwrap();

        params.manager_private_address = Some("10.0.0.9".to_string());
        let with_address = render(&params).unwrap();

        assert_eq!(plain, with_address);
        assert!(!with_address.text().contains("10.0.0.9"));
    }

    #[test]
    fn test_worker_script() {
        let script = render(&ScriptParams::worker("swarm-token", "10.0.0.2", users())).unwrap();
        let text = script.text();

        assert_eq!(script.role(), NodeRole::Worker);
        assert!(text.contains("apt update && apt -y install docker.io"));
        assert!(text.contains(
            "docker swarm join --token \"$(gcloud secrets versions access latest --secret=swarm-token)\" 10.0.0.2:2377"
        ));
        assert!(!text.contains("docker swarm init"));
        assert!(!text.contains("gcloud secrets versions add"));
        assert!(text.contains("for user in alice deployer;"));
    }

    #[test]
    fn test_worker_requires_address() {
        let mut params = ScriptParams::worker("swarm-token", "10.0.0.2", users());
        params.manager_private_address = None;
        assert!(matches!(render(&params), Err(DeployError::ScriptValidation(_))));

        params.manager_private_address = Some("  ".to_string());
        assert!(matches!(render(&params), Err(DeployError::ScriptValidation(_))));

        params.manager_private_address = Some("10.0.0.2; rm -rf /".to_string());
        assert!(matches!(render(&params), Err(DeployError::ScriptValidation(_))));
    }

    #[test]
    fn test_render_is_deterministic() {
        let params = ScriptParams::worker("swarm-token", "10.0.0.2", users());
        let first = render(&params).unwrap();
        let second = render(&params).unwrap();
        assert_eq!(first.text(), second.text());
        assert_eq!(first.digest(), second.digest());
        assert_eq!(first.digest().len(), 64);
    }

    #[test]
    fn test_empty_users_is_noop_step() {
        let script = render(&ScriptParams::manager("swarm-token", false, Vec::new())).unwrap();
        let last = script.text().trim_end().lines().last().unwrap();
        assert_eq!(last, ": # no local users to add to the docker group");
        assert!(!script.text().contains("usermod"));
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let params = ScriptParams::manager("token; curl evil", false, users());
        assert!(render(&params).is_err());

        let params = ScriptParams::manager("swarm-token", false, vec!["$(id)".to_string()]);
        assert!(render(&params).is_err());
    }

    #[test]
    fn test_custom_address_pool() {
        let params = ScriptParams::manager("swarm-token", false, users()).address_pool(AddressPool {
            cidr: "172.30.0.0/16".to_string(),
            mask_length: 26,
        });
        let script = render(&params).unwrap();
        assert!(script
            .text()
            .contains("--default-addr-pool 172.30.0.0/16 --default-addr-pool-mask-length 26"));

        let params = ScriptParams::manager("swarm-token", false, users()).address_pool(AddressPool {
            cidr: "172.30.0.0/16".to_string(),
            mask_length: 8,
        });
        assert!(render(&params).is_err());
    }
}
