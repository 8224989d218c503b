//! Deployed state, persisted between invocations.

use agentstack_core::provider::Materialized;
use agentstack_core::resource::Resource;
use agentstack_core::stack::ResolvedOutput;
use agentstack_core::{DeploymentId, Environment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A resource as last submitted, with its provider-side record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedResource {
    /// Definition with every reference resolved to a literal.
    pub definition: Resource,
    pub materialized: Materialized,
}

impl DeployedResource {
    pub fn logical_id(&self) -> &str {
        &self.materialized.logical_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedStack {
    pub name: String,
    pub env: Environment,
    pub deployment_id: DeploymentId,
    pub deployed_at: DateTime<Utc>,
    /// In definition order.
    pub resources: Vec<DeployedResource>,
    pub outputs: Vec<ResolvedOutput>,
    /// Export names this stack imported.
    pub imports: BTreeSet<String>,
}

impl DeployedStack {
    pub fn resource(&self, logical_id: &str) -> Option<&DeployedResource> {
        self.resources.iter().find(|r| r.logical_id() == logical_id)
    }

    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().filter_map(|o| o.export_name.as_deref())
    }

    pub(crate) fn materialized(&self) -> BTreeMap<String, Materialized> {
        self.resources
            .iter()
            .map(|r| (r.logical_id().to_string(), r.materialized.clone()))
            .collect()
    }
}

/// Every deployed stack, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedState {
    pub stacks: BTreeMap<String, DeployedStack>,
}

impl DeployedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&DeployedStack> {
        self.stacks.get(name)
    }

    pub fn is_deployed(&self, name: &str) -> bool {
        self.stacks.contains_key(name)
    }
}
