//! Docker Swarm bootstrap
//!
//! This module renders node startup scripts, probes manager readiness and
//! drives the bootstrap state machine that brings a swarm up.

pub mod node;
pub mod orchestrator;
pub mod probe;
pub mod script;
pub mod state;

pub use node::{Node, NodeOutput, NodeRole, Template};
pub use orchestrator::{Deployment, RunFailure, SwarmOrchestrator};
pub use probe::{await_ready, ProbeConfig, ProbeOutcome, ReadinessProbe, TcpProbe};
pub use script::{render, AddressPool, BootstrapScript, ScriptParams};
pub use state::{transition, BootstrapEvent, BootstrapState, StateKind};
