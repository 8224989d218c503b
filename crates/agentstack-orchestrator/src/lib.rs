//! Stack deployment for AgentStack.
//!
//! Deploys stacks in export/import dependency order, diffs each stack against
//! its deployed state, applies changes through a [`Provider`](agentstack_core::provider::Provider)
//! and rolls back a stack that fails part way.

pub mod orchestrator;
pub mod plan;
pub mod state;

pub use orchestrator::{DeploymentEvent, DeploymentResult, Orchestrator, StackReport, StackState};
pub use plan::{ChangeAction, PlanSummary, ResourceChange};
pub use state::{DeployedResource, DeployedStack, DeployedState};
