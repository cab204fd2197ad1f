//! Deployment file parser

use super::cluster::DeploymentConfig;
use crate::error::{DeployError, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default deployment file names
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "swarm.yaml",
    "swarm.yml",
    "swarm-deploy.yaml",
    "swarm-deploy.yml",
];

/// Deployment file parser
pub struct ConfigParser;

impl ConfigParser {
    /// Find a deployment file in a directory
    pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_CONFIG_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Find a deployment file in the working directory, then the user config dir
    pub fn discover() -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok();
        cwd.as_deref()
            .and_then(Self::find_config_file)
            .or_else(|| {
                dirs::config_dir()
                    .map(|dir| dir.join("swarm-deploy"))
                    .and_then(|dir| Self::find_config_file(&dir))
            })
    }

    /// Parse a deployment file, interpolating the process environment
    pub fn parse_file(path: &Path) -> Result<DeploymentConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::ConfigParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let env: HashMap<String, String> = std::env::vars().collect();
        Self::parse_str(&content, &env)
    }

    /// Parse a deployment document
    pub fn parse_str(content: &str, env: &HashMap<String, String>) -> Result<DeploymentConfig> {
        let content = interpolate(content, env)?;
        serde_yaml::from_str(&content)
            .map_err(|e| DeployError::ConfigParse(format!("Failed to parse YAML: {}", e)))
    }
}

/// Replace `${VAR}` and `${VAR:-default}` references
pub fn interpolate(content: &str, env: &HashMap<String, String>) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| DeployError::Internal(format!("invalid pattern: {}", e)))?;

    let mut missing = Vec::new();
    let result = re.replace_all(content, |caps: &Captures| {
        let var = &caps[1];
        match (env.get(var), caps.get(3)) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.push(var.to_string());
                String::new()
            }
        }
    });
    let result = result.into_owned();

    if !missing.is_empty() {
        return Err(DeployError::ConfigParse(format!(
            "undefined variables: {}",
            missing.join(", ")
        )));
    }
    Ok(result)
}
