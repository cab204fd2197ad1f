//! Error types for swarm-deploy

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for swarm-deploy operations
pub type Result<T> = std::result::Result<T, DeployError>;

/// Orchestration phase a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Checks performed before anything is created
    Preflight,
    /// Creating the manager node
    ManagerCreation,
    /// Waiting for the manager to accept connections
    Readiness,
    /// Creating the worker template
    TemplateCreation,
    /// Creating the worker with the given node index
    Worker(u32),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Preflight => write!(f, "preflight"),
            Phase::ManagerCreation => write!(f, "manager creation"),
            Phase::Readiness => write!(f, "manager readiness"),
            Phase::TemplateCreation => write!(f, "template creation"),
            Phase::Worker(index) => write!(f, "worker {} creation", index),
        }
    }
}

/// swarm-deploy error types
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Provisioning failed during {phase}: {message}")]
    Provisioning { phase: Phase, message: String },

    #[error(
        "Manager unreachable at {address}:{port} after {attempts} attempts ({elapsed:?})"
    )]
    ReadinessTimeout {
        address: String,
        port: u16,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("Request rejected by provider: {0}")]
    ProviderRejected(String),

    #[error("Script validation error: {0}")]
    ScriptValidation(String),

    #[error("Secret channel error: {0}")]
    SecretChannel(String),

    #[error("Invalid state transition: {event} in state {state}")]
    InvalidTransition { state: String, event: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Build a provisioning error for a phase
    pub fn provisioning(phase: Phase, message: impl Into<String>) -> Self {
        DeployError::Provisioning {
            phase,
            message: message.into(),
        }
    }
}
