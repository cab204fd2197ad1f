//! Swarm bootstrap orchestration
//!
//! Drives the state machine in `state` against injected collaborators:
//! create the manager, wait (bounded) until it accepts connections, render
//! the worker script with the manager's private address, create the worker
//! template, then stamp out the remaining nodes across zones.
//!
//! Provisioning errors abort the run without retry or rollback. Nodes that
//! were already created are reported in the failure and must be cleaned up
//! by hand.

use super::node::{node_name, template_prefix, zone_for, Node, NodeOutput, NodeRole, Template};
use super::probe::ReadinessProbe;
use super::script::{render, ScriptParams};
use super::state::{transition, BootstrapEvent, BootstrapState, StateKind};
use crate::config::ClusterSpec;
use crate::error::{DeployError, Phase, Result};
use crate::provider::{InstanceSpec, NodeRequest, NodeSource, Providers, TemplateRequest};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct Deployment {
    /// Run identifier
    pub run_id: String,
    /// Nodes in index order, manager first
    pub nodes: Vec<Node>,
    /// Worker template, absent for a single-node swarm
    pub template: Option<Template>,
    /// States visited
    pub history: Vec<StateKind>,
}

impl Deployment {
    /// The manager node
    pub fn manager(&self) -> Option<&Node> {
        self.nodes.first()
    }

    /// Externally observable outputs, one per node
    pub fn outputs(&self) -> Vec<NodeOutput> {
        NodeOutput::from_nodes(&self.nodes)
    }
}

/// A run that stopped before completing
#[derive(Debug, Error)]
#[error("{}", failure_message(.phase, .error))]
pub struct RunFailure {
    /// Phase that failed
    pub phase: Phase,
    /// Underlying error
    #[source]
    pub error: DeployError,
    /// Nodes that were created and left in place
    pub created: Vec<NodeOutput>,
    /// States visited
    pub history: Vec<StateKind>,
}

fn failure_message(phase: &Phase, error: &DeployError) -> String {
    match error {
        // Already names the phase
        DeployError::Provisioning { .. } => error.to_string(),
        _ => format!("Deployment failed during {}: {}", phase, error),
    }
}

/// Swarm bootstrap orchestrator
pub struct SwarmOrchestrator {
    run_id: String,
    spec: Arc<ClusterSpec>,
    providers: Providers,
    probe: Arc<dyn ReadinessProbe>,
    state: BootstrapState,
    history: Vec<StateKind>,
    created: Vec<NodeOutput>,
    error: Option<DeployError>,
}

impl SwarmOrchestrator {
    /// Create an orchestrator for a cluster spec
    pub fn new(spec: ClusterSpec, providers: Providers, probe: Arc<dyn ReadinessProbe>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            spec: Arc::new(spec),
            providers,
            probe,
            state: BootstrapState::Init,
            history: vec![StateKind::Init],
            created: Vec::new(),
            error: None,
        }
    }

    /// Run identifier
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Current state
    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    /// Drive the run to completion or failure
    pub async fn run(mut self) -> std::result::Result<Deployment, RunFailure> {
        tracing::info!(
            "Bootstrapping swarm {} with {} nodes (run {})",
            self.spec.name,
            self.spec.instance_count,
            self.run_id
        );

        loop {
            let event = match self.state.clone() {
                BootstrapState::Init => self.preflight().await,
                BootstrapState::ManagerProvisioning => self.create_manager().await,
                BootstrapState::AwaitingManagerReady { manager } => {
                    self.await_manager(&manager).await
                }
                BootstrapState::TemplateProvisioning { manager } => {
                    self.create_template(&manager).await
                }
                BootstrapState::WorkersProvisioning { template, .. } => {
                    self.create_workers(&template).await
                }
                BootstrapState::Complete { nodes, template } => {
                    tracing::info!("Swarm {} complete with {} nodes", self.spec.name, nodes.len());
                    return Ok(Deployment {
                        run_id: self.run_id,
                        nodes,
                        template,
                        history: self.history,
                    });
                }
                BootstrapState::Failed { phase, reason } => {
                    tracing::error!("Swarm {} failed during {}: {}", self.spec.name, phase, reason);
                    let error = self
                        .error
                        .take()
                        .unwrap_or_else(|| DeployError::provisioning(phase, reason));
                    return Err(self.failure(phase, error));
                }
            };

            self.apply(event)?;
        }
    }

    fn apply(&mut self, event: BootstrapEvent) -> std::result::Result<(), RunFailure> {
        let from = self.state.kind();
        let phase = self.state.phase().unwrap_or(Phase::Preflight);

        match transition(self.state.clone(), event) {
            Ok(next) => {
                tracing::debug!("Bootstrap state {} -> {}", from, next.kind());
                self.history.push(next.kind());
                self.state = next;
                Ok(())
            }
            Err(e) => Err(self.failure(phase, e)),
        }
    }

    fn failure(&self, phase: Phase, error: DeployError) -> RunFailure {
        RunFailure {
            phase,
            error,
            created: self.created.clone(),
            history: self.history.clone(),
        }
    }

    fn fail(&mut self, phase: Phase, error: DeployError) -> BootstrapEvent {
        let message = error.to_string();
        self.error = Some(error);
        BootstrapEvent::ProvisioningFailed { phase, message }
    }

    fn instance_spec(&self, script: String) -> InstanceSpec {
        InstanceSpec {
            machine_type: self.spec.machine_type.clone(),
            image: self.spec.instance_image_id.clone(),
            script,
            subnet_id: self.spec.subnet_id.clone(),
            ssh_metadata: self.spec.ssh_metadata(),
            identity: self.spec.compute_identity.clone(),
        }
    }

    fn zone(&self, index: usize) -> Result<String> {
        zone_for(index, &self.spec.zones)
            .map(str::to_string)
            .ok_or_else(|| DeployError::InvalidConfig("no candidate zones".to_string()))
    }

    async fn preflight(&mut self) -> BootstrapEvent {
        if !self.spec.secret_user_managed {
            return BootstrapEvent::Start;
        }

        // The manager script skips creating a user-managed secret
        match self.providers.secrets.exists(&self.spec.secret_name).await {
            Ok(true) => BootstrapEvent::Start,
            Ok(false) => self.fail(
                Phase::Preflight,
                DeployError::SecretChannel(format!(
                    "secret {} is user-managed but does not exist",
                    self.spec.secret_name
                )),
            ),
            Err(e) => self.fail(Phase::Preflight, e),
        }
    }

    async fn create_manager(&mut self) -> BootstrapEvent {
        match self.provision_manager().await {
            Ok(manager) => {
                self.created.push(NodeOutput::new(0, &manager));
                BootstrapEvent::ManagerCreated(manager)
            }
            Err(e) => self.fail(Phase::ManagerCreation, e),
        }
    }

    async fn provision_manager(&self) -> Result<Node> {
        let params = ScriptParams::manager(
            &self.spec.secret_name,
            self.spec.secret_user_managed,
            self.spec.local_users(),
        )
        .address_pool(self.spec.address_pool.clone());
        let script = render(&params)?;

        let request = NodeRequest {
            name: node_name(&self.spec.name, 0),
            zone: self.zone(0)?,
            role: NodeRole::Manager,
            source: NodeSource::Image(self.instance_spec(script.into_text())),
        };

        tracing::info!("Creating manager {} in {}", request.name, request.zone);
        let manager = self
            .providers
            .nodes
            .create_node(&request)
            .await
            .map_err(|e| DeployError::provisioning(Phase::ManagerCreation, e.to_string()))?;

        if manager.private_address.trim().is_empty() {
            return Err(DeployError::provisioning(
                Phase::ManagerCreation,
                format!("manager {} has no private address", manager.name),
            ));
        }
        Ok(manager)
    }

    async fn await_manager(&mut self, manager: &Node) -> BootstrapEvent {
        tracing::info!(
            "Waiting for manager {} at {}",
            manager.name,
            manager.private_address
        );

        let outcome = self.probe.await_ready(&manager.private_address).await;
        if outcome.is_ready() {
            tracing::info!(
                "Manager {} accepted connections after {} attempts; treating it as likely ready",
                manager.name,
                outcome.attempts
            );
            return BootstrapEvent::ManagerReady;
        }

        self.error = Some(DeployError::ReadinessTimeout {
            address: manager.private_address.clone(),
            port: self.probe.port(),
            attempts: outcome.attempts,
            elapsed: outcome.elapsed,
        });
        BootstrapEvent::ReadinessExhausted {
            attempts: outcome.attempts,
            elapsed: outcome.elapsed,
        }
    }

    async fn create_template(&mut self, manager: &Node) -> BootstrapEvent {
        if self.spec.worker_count() == 0 {
            return BootstrapEvent::NoWorkersRequired;
        }

        match self.provision_template(manager).await {
            Ok(template) => BootstrapEvent::TemplateCreated(template),
            Err(e) => self.fail(Phase::TemplateCreation, e),
        }
    }

    async fn provision_template(&self, manager: &Node) -> Result<Template> {
        let params = ScriptParams::worker(
            &self.spec.secret_name,
            &manager.private_address,
            self.spec.local_users(),
        );
        let script = render(&params)?;

        let request = TemplateRequest {
            name_prefix: template_prefix(&self.spec.name),
            region: self.spec.region.clone(),
            script_digest: script.digest(),
            instance: self.instance_spec(script.into_text()),
            depends_on: vec![manager.name.clone()],
        };

        tracing::info!(
            "Creating worker template {} joining {}",
            request.template_name(),
            manager.join_address()
        );
        self.providers
            .templates
            .create_template(&request)
            .await
            .map_err(|e| DeployError::provisioning(Phase::TemplateCreation, e.to_string()))
    }

    fn worker_requests(&self, template: &Template) -> Result<Vec<(u32, NodeRequest)>> {
        (1..self.spec.instance_count)
            .map(|index| {
                Ok((
                    index,
                    NodeRequest {
                        name: node_name(&self.spec.name, index as usize),
                        zone: self.zone(index as usize)?,
                        role: NodeRole::Worker,
                        source: NodeSource::Template(template.clone()),
                    },
                ))
            })
            .collect()
    }

    async fn create_workers(&mut self, template: &Template) -> BootstrapEvent {
        let requests = match self.worker_requests(template) {
            Ok(requests) => requests,
            Err(e) => return self.fail(Phase::Worker(1), e),
        };

        tracing::info!(
            "Creating {} workers from template {}",
            requests.len(),
            template.name
        );

        let results = if self.spec.parallel_workers {
            let nodes = &self.providers.nodes;
            let pending = requests.iter().map(|(index, request)| async move {
                (*index, nodes.create_node(request).await)
            });
            futures::future::join_all(pending).await
        } else {
            let mut results = Vec::with_capacity(requests.len());
            for (index, request) in &requests {
                let result = self.providers.nodes.create_node(request).await;
                let failed = result.is_err();
                results.push((*index, result));
                if failed {
                    break;
                }
            }
            results
        };

        let mut workers = Vec::with_capacity(results.len());
        let mut first_failure = None;
        for (index, result) in results {
            match result {
                Ok(node) => {
                    tracing::debug!("Worker {} created in {}", node.name, node.zone);
                    self.created.push(NodeOutput::new(index as usize, &node));
                    workers.push(node);
                }
                Err(e) => {
                    tracing::warn!("Worker {} failed: {}", index, e);
                    if first_failure.is_none() {
                        first_failure = Some((index, e));
                    }
                }
            }
        }

        match first_failure {
            Some((index, e)) => self.fail(
                Phase::Worker(index),
                DeployError::provisioning(Phase::Worker(index), e.to_string()),
            ),
            None => BootstrapEvent::WorkersCreated(workers),
        }
    }
}
