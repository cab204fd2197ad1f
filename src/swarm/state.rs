//! Bootstrap state machine
//!
//! `Init → ManagerProvisioning → AwaitingManagerReady → TemplateProvisioning
//! → WorkersProvisioning → Complete`, with `Failed` reachable from every
//! non-terminal state. Transitions are pure; the orchestrator performs the
//! side effect for each state and feeds the result back as an event.

use super::node::{Node, Template};
use crate::error::{DeployError, Phase, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bootstrap state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    /// Nothing done yet
    Init,
    /// Manager node is being created
    ManagerProvisioning,
    /// Manager exists, waiting for it to accept connections
    AwaitingManagerReady { manager: Node },
    /// Manager is ready, worker template is being created
    TemplateProvisioning { manager: Node },
    /// Workers are being stamped from the template
    WorkersProvisioning { manager: Node, template: Template },
    /// All nodes exist, manager first
    Complete {
        nodes: Vec<Node>,
        template: Option<Template>,
    },
    /// Run aborted
    Failed { phase: Phase, reason: String },
}

/// State name without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Init,
    ManagerProvisioning,
    AwaitingManagerReady,
    TemplateProvisioning,
    WorkersProvisioning,
    Complete,
    Failed,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Init => "init",
            StateKind::ManagerProvisioning => "manager-provisioning",
            StateKind::AwaitingManagerReady => "awaiting-manager-ready",
            StateKind::TemplateProvisioning => "template-provisioning",
            StateKind::WorkersProvisioning => "workers-provisioning",
            StateKind::Complete => "complete",
            StateKind::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Result of the side effect performed in a state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapEvent {
    /// Preflight passed
    Start,
    /// Manager node was created
    ManagerCreated(Node),
    /// Manager accepted connections
    ManagerReady,
    /// Manager never accepted connections
    ReadinessExhausted { attempts: u32, elapsed: Duration },
    /// Worker template was created
    TemplateCreated(Template),
    /// Single-node swarm, nothing to stamp
    NoWorkersRequired,
    /// All workers were created, in index order
    WorkersCreated(Vec<Node>),
    /// A provisioning step failed
    ProvisioningFailed { phase: Phase, message: String },
}

impl BootstrapEvent {
    fn name(&self) -> &'static str {
        match self {
            BootstrapEvent::Start => "start",
            BootstrapEvent::ManagerCreated(_) => "manager-created",
            BootstrapEvent::ManagerReady => "manager-ready",
            BootstrapEvent::ReadinessExhausted { .. } => "readiness-exhausted",
            BootstrapEvent::TemplateCreated(_) => "template-created",
            BootstrapEvent::NoWorkersRequired => "no-workers-required",
            BootstrapEvent::WorkersCreated(_) => "workers-created",
            BootstrapEvent::ProvisioningFailed { .. } => "provisioning-failed",
        }
    }
}

impl BootstrapState {
    /// State name
    pub fn kind(&self) -> StateKind {
        match self {
            BootstrapState::Init => StateKind::Init,
            BootstrapState::ManagerProvisioning => StateKind::ManagerProvisioning,
            BootstrapState::AwaitingManagerReady { .. } => StateKind::AwaitingManagerReady,
            BootstrapState::TemplateProvisioning { .. } => StateKind::TemplateProvisioning,
            BootstrapState::WorkersProvisioning { .. } => StateKind::WorkersProvisioning,
            BootstrapState::Complete { .. } => StateKind::Complete,
            BootstrapState::Failed { .. } => StateKind::Failed,
        }
    }

    /// Check if no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BootstrapState::Complete { .. } | BootstrapState::Failed { .. }
        )
    }

    /// Phase a failure in this state is attributed to
    pub fn phase(&self) -> Option<Phase> {
        match self {
            BootstrapState::Init => Some(Phase::Preflight),
            BootstrapState::ManagerProvisioning => Some(Phase::ManagerCreation),
            BootstrapState::AwaitingManagerReady { .. } => Some(Phase::Readiness),
            BootstrapState::TemplateProvisioning { .. } => Some(Phase::TemplateCreation),
            BootstrapState::WorkersProvisioning { .. } => Some(Phase::Worker(1)),
            BootstrapState::Complete { .. } => None,
            BootstrapState::Failed { phase, .. } => Some(*phase),
        }
    }
}

/// Apply an event to a state
pub fn transition(state: BootstrapState, event: BootstrapEvent) -> Result<BootstrapState> {
    use BootstrapEvent as E;
    use BootstrapState as S;

    let next = match (state, event) {
        (S::Init, E::Start) => S::ManagerProvisioning,
        (S::ManagerProvisioning, E::ManagerCreated(manager)) if manager.is_manager() => {
            S::AwaitingManagerReady { manager }
        }
        (S::AwaitingManagerReady { manager }, E::ManagerReady) => {
            S::TemplateProvisioning { manager }
        }
        (S::AwaitingManagerReady { manager }, E::ReadinessExhausted { attempts, elapsed }) => {
            S::Failed {
                phase: Phase::Readiness,
                reason: format!(
                    "manager {} unreachable after {} attempts ({:?})",
                    manager.name, attempts, elapsed
                ),
            }
        }
        (S::TemplateProvisioning { manager }, E::TemplateCreated(template)) => {
            S::WorkersProvisioning { manager, template }
        }
        (S::TemplateProvisioning { manager }, E::NoWorkersRequired) => S::Complete {
            nodes: vec![manager],
            template: None,
        },
        (S::WorkersProvisioning { manager, template }, E::WorkersCreated(workers)) => {
            let mut nodes = Vec::with_capacity(workers.len() + 1);
            nodes.push(manager);
            nodes.extend(workers);
            S::Complete {
                nodes,
                template: Some(template),
            }
        }
        (state, E::ProvisioningFailed { phase, message }) if !state.is_terminal() => S::Failed {
            phase,
            reason: message,
        },
        (state, event) => {
            return Err(DeployError::InvalidTransition {
                state: state.kind().to_string(),
                event: event.name().to_string(),
            })
        }
    };

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::node::NodeRole;
    use chrono::Utc;

    fn node(name: &str, role: NodeRole) -> Node {
        Node {
            name: name.to_string(),
            role,
            zone: "europe-west2-a".to_string(),
            private_address: "10.0.0.2".to_string(),
            external_address: None,
            created_at: Utc::now(),
        }
    }

    fn template() -> Template {
        Template {
            name: "demo-swarm-node-abc".to_string(),
            self_link: "templates/demo-swarm-node-abc".to_string(),
            script_digest: "abc".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_happy_path() {
        let manager = node("demo-swarm-node-0", NodeRole::Manager);
        let worker = node("demo-swarm-node-1", NodeRole::Worker);

        let state = transition(BootstrapState::Init, BootstrapEvent::Start).unwrap();
        assert_eq!(state.kind(), StateKind::ManagerProvisioning);

        let state = transition(state, BootstrapEvent::ManagerCreated(manager.clone())).unwrap();
        assert_eq!(state.kind(), StateKind::AwaitingManagerReady);

        let state = transition(state, BootstrapEvent::ManagerReady).unwrap();
        assert_eq!(state.kind(), StateKind::TemplateProvisioning);

        let state = transition(state, BootstrapEvent::TemplateCreated(template())).unwrap();
        assert_eq!(state.kind(), StateKind::WorkersProvisioning);

        let state = transition(state, BootstrapEvent::WorkersCreated(vec![worker.clone()])).unwrap();
        match state {
            BootstrapState::Complete { nodes, template } => {
                assert_eq!(nodes, vec![manager, worker]);
                assert!(template.is_some());
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_readiness_exhausted_fails() {
        let state = BootstrapState::AwaitingManagerReady {
            manager: node("demo-swarm-node-0", NodeRole::Manager),
        };
        let state = transition(
            state,
            BootstrapEvent::ReadinessExhausted {
                attempts: 30,
                elapsed: Duration::from_secs(300),
            },
        )
        .unwrap();

        assert!(state.is_terminal());
        assert_eq!(state.phase(), Some(Phase::Readiness));
    }

    #[test]
    fn test_template_requires_ready_manager() {
        let state = BootstrapState::AwaitingManagerReady {
            manager: node("demo-swarm-node-0", NodeRole::Manager),
        };
        let result = transition(state, BootstrapEvent::TemplateCreated(template()));
        assert!(matches!(result, Err(DeployError::InvalidTransition { .. })));
    }

    #[test]
    fn test_workers_require_template() {
        let state = BootstrapState::TemplateProvisioning {
            manager: node("demo-swarm-node-0", NodeRole::Manager),
        };
        let result = transition(state, BootstrapEvent::WorkersCreated(Vec::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_manager_event_must_carry_manager() {
        let result = transition(
            BootstrapState::ManagerProvisioning,
            BootstrapEvent::ManagerCreated(node("demo-swarm-node-0", NodeRole::Worker)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_single_node_completes_without_template() {
        let manager = node("demo-swarm-node-0", NodeRole::Manager);
        let state = BootstrapState::TemplateProvisioning {
            manager: manager.clone(),
        };
        let state = transition(state, BootstrapEvent::NoWorkersRequired).unwrap();
        assert_eq!(
            state,
            BootstrapState::Complete {
                nodes: vec![manager],
                template: None
            }
        );
    }

    #[test]
    fn test_terminal_states_reject_events() {
        let failed = BootstrapState::Failed {
            phase: Phase::ManagerCreation,
            reason: "quota".to_string(),
        };
        let result = transition(
            failed,
            BootstrapEvent::ProvisioningFailed {
                phase: Phase::TemplateCreation,
                message: "again".to_string(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_provisioning_failure_from_any_active_state() {
        let state = transition(
            BootstrapState::ManagerProvisioning,
            BootstrapEvent::ProvisioningFailed {
                phase: Phase::ManagerCreation,
                message: "invalid image".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            state,
            BootstrapState::Failed {
                phase: Phase::ManagerCreation,
                reason: "invalid image".to_string()
            }
        );
    }
}
