//! Change plans.

use agentstack_core::resource::{RemovalPolicy, Resource, ResourceKind};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::state::{DeployedResource, DeployedStack};

/// What happens to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    #[display("create")]
    Create,
    #[display("update")]
    Update,
    #[display("delete")]
    Delete,
    /// Dropped from the stack but left in place.
    #[display("retain")]
    Retain,
}

/// A resource change in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub logical_id: String,
    pub kind: ResourceKind,
    pub action: ChangeAction,
}

impl ResourceChange {
    pub fn new(resource: &Resource, action: ChangeAction) -> Self {
        Self {
            logical_id: resource.logical_id().to_string(),
            kind: resource.kind(),
            action,
        }
    }
}

/// Summary of a stack diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub stack: String,
    pub to_add: Vec<ResourceChange>,
    pub to_change: Vec<ResourceChange>,
    /// Deleted or retained resources no longer in the definition.
    pub to_destroy: Vec<ResourceChange>,
}

impl PlanSummary {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_change.is_empty() && self.to_destroy.is_empty()
    }

    pub fn record(&mut self, change: ResourceChange) {
        match change.action {
            ChangeAction::Create => self.to_add.push(change),
            ChangeAction::Update => self.to_change.push(change),
            ChangeAction::Delete | ChangeAction::Retain => self.to_destroy.push(change),
        }
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} to add, {} to change, {} to destroy",
            self.stack,
            self.to_add.len(),
            self.to_change.len(),
            self.to_destroy.len()
        )
    }
}

/// Diff desired resources against the deployed stack.
///
/// `desired` pairs each definition with its fully resolved form, or `None`
/// when some reference is only known after apply. Such resources are never
/// reported as unchanged.
pub(crate) fn diff(
    stack: &str,
    desired: &[(&Resource, Option<Resource>)],
    previous: Option<&DeployedStack>,
) -> PlanSummary {
    let mut summary = PlanSummary::new(stack);

    for (resource, resolved) in desired {
        match previous.and_then(|p| p.resource(resource.logical_id())) {
            None => summary.record(ResourceChange::new(resource, ChangeAction::Create)),
            Some(deployed) if resolved.as_ref() == Some(&deployed.definition) => {}
            Some(_) => summary.record(ResourceChange::new(resource, ChangeAction::Update)),
        }
    }

    for deployed in removed(desired.iter().map(|(r, _)| *r), previous) {
        let action = removal_action(&deployed.definition);
        summary.record(ResourceChange::new(&deployed.definition, action));
    }

    summary
}

/// Deployed resources absent from `desired`, in definition order.
pub(crate) fn removed<'a, 'b>(
    desired: impl Iterator<Item = &'b Resource>,
    previous: Option<&'a DeployedStack>,
) -> Vec<&'a DeployedResource> {
    let ids: Vec<&str> = desired.map(Resource::logical_id).collect();
    previous
        .map(|p| {
            p.resources
                .iter()
                .filter(|r| !ids.contains(&r.logical_id()))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn removal_action(resource: &Resource) -> ChangeAction {
    match resource.removal_policy() {
        RemovalPolicy::Retain => ChangeAction::Retain,
        RemovalPolicy::Destroy { .. } => ChangeAction::Delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_plan_display() {
        let summary = PlanSummary::new("AgentCoreInfra");
        assert!(summary.is_empty());
        assert_eq!(
            summary.to_string(),
            "AgentCoreInfra: 0 to add, 0 to change, 0 to destroy"
        );
    }

    #[test]
    fn test_record_sorts_by_action() {
        let mut summary = PlanSummary::new("S");
        for action in [
            ChangeAction::Create,
            ChangeAction::Update,
            ChangeAction::Delete,
            ChangeAction::Retain,
        ] {
            summary.record(ResourceChange {
                logical_id: action.to_string(),
                kind: ResourceKind::Repository,
                action,
            });
        }
        assert_eq!(summary.to_add.len(), 1);
        assert_eq!(summary.to_change.len(), 1);
        assert_eq!(summary.to_destroy.len(), 2);
        assert!(!summary.is_empty());
    }
}
