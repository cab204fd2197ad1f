//! Deployment configuration
//!
//! A deployment file is parsed, interpolated against the environment and
//! validated once, producing the immutable `ClusterSpec` a run works from.

pub mod cluster;
pub mod parser;

pub use cluster::{ClusterSpec, DeploymentConfig, ProviderSettings, ReadinessSettings, SwarmSettings};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES};
