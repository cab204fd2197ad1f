//! swarm-deploy - Docker Swarm bootstrap for cloud VMs
//!
//! Brings up a Docker Swarm on freshly provisioned instances:
//!
//! - A manager node that initialises the swarm and publishes its join token
//!   to a secret store
//! - A bounded readiness wait on the manager
//! - A worker template that joins the manager by private address
//! - Workers stamped from the template across zones

pub mod config;
pub mod error;
pub mod provider;
pub mod swarm;

pub use error::{DeployError, Phase, Result};
