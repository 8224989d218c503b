//! Stack orchestrator - deploys stacks in export/import dependency order.

use agentstack_core::provider::{Materialized, Provider};
use agentstack_core::resource::{RemovalPolicy, Resource};
use agentstack_core::stack::ResolvedOutput;
use agentstack_core::{CrossStackChannel, DeploymentId, Error, Result, Stack, ValueRef};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

use crate::plan::{self, ChangeAction, PlanSummary, ResourceChange};
use crate::state::{DeployedResource, DeployedStack, DeployedState};

/// State of a stack during a multi-stack deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackState {
    Pending,
    Deployed,
    Failed { message: String },
    Skipped { reason: String },
}

impl StackState {
    pub fn is_success(&self) -> bool {
        matches!(self, StackState::Deployed)
    }
}

/// Event emitted during deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    StackStarted {
        stack: String,
        deployment_id: DeploymentId,
    },
    ResourceApplied {
        stack: String,
        logical_id: String,
        action: ChangeAction,
    },
    StackCompleted {
        stack: String,
        success: bool,
    },
    StackRolledBack {
        stack: String,
        reason: String,
    },
    StackSkipped {
        stack: String,
        reason: String,
    },
}

/// Outcome of deploying one stack.
#[derive(Debug, Clone)]
pub struct StackReport {
    pub stack: String,
    pub deployment_id: DeploymentId,
    /// Changes actually applied.
    pub changes: PlanSummary,
    pub outputs: Vec<ResolvedOutput>,
}

/// Result of a multi-stack deployment.
#[derive(Debug)]
pub struct DeploymentResult {
    pub success: bool,
    /// Deployment order.
    pub order: Vec<String>,
    pub stack_states: HashMap<String, StackState>,
    pub reports: Vec<StackReport>,
}

/// A provider call made during one attempt, kept for rollback.
enum Applied {
    Created {
        resource: Resource,
        materialized: Materialized,
    },
    Updated {
        previous: DeployedResource,
        materialized: Materialized,
    },
}

/// Progress of one stack deployment attempt.
struct Attempt {
    journal: Vec<Applied>,
    resources: BTreeMap<String, DeployedResource>,
    materialized: BTreeMap<String, Materialized>,
    changes: PlanSummary,
}

/// Drives stacks through a provider and the cross-stack channel.
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    channel: Arc<CrossStackChannel>,
    /// Held for the whole of a deploy or destroy, serializing writers.
    state: Mutex<DeployedState>,
    events: Option<mpsc::Sender<DeploymentEvent>>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn Provider>, channel: Arc<CrossStackChannel>) -> Self {
        Self {
            provider,
            channel,
            state: Mutex::new(DeployedState::default()),
            events: None,
        }
    }

    /// Resume from previously persisted state.
    pub fn with_state(mut self, state: DeployedState) -> Self {
        self.state = Mutex::new(state);
        self
    }

    /// Stream deployment events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<DeploymentEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Name of the provider resources are materialized through.
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn channel(&self) -> &Arc<CrossStackChannel> {
        &self.channel
    }

    pub async fn state(&self) -> DeployedState {
        self.state.lock().await.clone()
    }

    pub async fn outputs(&self, stack: &str) -> Option<Vec<ResolvedOutput>> {
        self.state
            .lock()
            .await
            .get(stack)
            .map(|s| s.outputs.clone())
    }

    async fn emit(&self, event: DeploymentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Deploy every stack, producers before consumers.
    ///
    /// A stack whose producer failed or was skipped is skipped. Fails
    /// without deploying anything when the stacks form a cycle.
    pub async fn deploy(&self, stacks: &[Stack]) -> Result<DeploymentResult> {
        let (order, needs) = dependency_order(stacks)?;
        let mut stack_states: HashMap<String, StackState> = stacks
            .iter()
            .map(|s| (s.name.clone(), StackState::Pending))
            .collect();
        let mut reports = Vec::new();

        for name in &order {
            let Some(stack) = stacks.iter().find(|s| s.name == *name) else {
                continue;
            };

            let failed_deps: Vec<&String> = needs
                .get(name)
                .into_iter()
                .flatten()
                .filter(|dep| !stack_states.get(*dep).is_some_and(StackState::is_success))
                .collect();
            if !failed_deps.is_empty() {
                let reason = format!("Producer stacks did not deploy: {:?}", failed_deps);
                info!(stack = %name, ?failed_deps, "Skipping stack due to failed producers");
                self.emit(DeploymentEvent::StackSkipped {
                    stack: name.clone(),
                    reason: reason.clone(),
                })
                .await;
                stack_states.insert(name.clone(), StackState::Skipped { reason });
                continue;
            }

            match self.deploy_stack(stack).await {
                Ok(report) => {
                    stack_states.insert(name.clone(), StackState::Deployed);
                    reports.push(report);
                }
                Err(e) => {
                    stack_states.insert(
                        name.clone(),
                        StackState::Failed {
                            message: e.to_string(),
                        },
                    );
                }
            }
        }

        let success = stack_states.values().all(StackState::is_success);
        Ok(DeploymentResult {
            success,
            order,
            stack_states,
            reports,
        })
    }

    /// Deploy a single stack.
    ///
    /// Imports are resolved before any provider call; an unresolved import
    /// fails the stack with nothing created. A failure after resources were
    /// touched rolls the attempt back, including exports it published.
    pub async fn deploy_stack(&self, stack: &Stack) -> Result<StackReport> {
        let mut state = self.state.lock().await;
        let deployment_id = DeploymentId::new();
        let previous = state.get(&stack.name).cloned();

        self.emit(DeploymentEvent::StackStarted {
            stack: stack.name.clone(),
            deployment_id,
        })
        .await;
        info!(
            stack = %stack.name,
            %deployment_id,
            provider = self.provider.name(),
            "Deploying stack"
        );

        let bound = match self.bind_imports(stack) {
            Ok(bound) => bound,
            Err(e) => {
                error!(stack = %stack.name, error = %e, "Stack imports did not resolve");
                self.emit(DeploymentEvent::StackCompleted {
                    stack: stack.name.clone(),
                    success: false,
                })
                .await;
                return Err(e);
            }
        };

        let mut attempt = Attempt {
            journal: Vec::new(),
            resources: BTreeMap::new(),
            materialized: previous
                .as_ref()
                .map(DeployedStack::materialized)
                .unwrap_or_default(),
            changes: PlanSummary::new(&stack.name),
        };

        let result = self
            .run_attempt(stack, &bound, previous.as_ref(), &mut attempt)
            .await;

        let outputs = match result {
            Ok(outputs) => outputs,
            Err(e) => {
                error!(stack = %stack.name, error = %e, "Stack deployment failed, rolling back");
                self.roll_back(stack, attempt, &e.to_string()).await;
                self.emit(DeploymentEvent::StackCompleted {
                    stack: stack.name.clone(),
                    success: false,
                })
                .await;
                return Err(match e {
                    e @ (Error::Conflict { .. }
                    | Error::UnresolvedImport { .. }
                    | Error::DuplicateResourceName { .. }
                    | Error::DeploymentFailed { .. }) => e,
                    other => Error::DeploymentFailed {
                        stack: stack.name.clone(),
                        message: other.to_string(),
                    },
                });
            }
        };

        let retained = self
            .remove_dropped(stack, &bound, previous.as_ref(), &mut attempt)
            .await;

        self.channel.commit(&stack.name)?;
        self.channel.release_imports(&stack.name)?;
        let imports = stack.imports();
        for name in &imports {
            self.channel.import(&stack.name, name)?;
        }

        let resources = bound
            .iter()
            .map(|r| r.logical_id())
            .chain(retained.iter().map(String::as_str))
            .filter_map(|id| attempt.resources.remove(id))
            .collect();

        state.stacks.insert(
            stack.name.clone(),
            DeployedStack {
                name: stack.name.clone(),
                env: stack.env.clone(),
                deployment_id,
                deployed_at: Utc::now(),
                resources,
                outputs: outputs.clone(),
                imports,
            },
        );

        info!(stack = %stack.name, changes = %attempt.changes, "Stack deployed");
        self.emit(DeploymentEvent::StackCompleted {
            stack: stack.name.clone(),
            success: true,
        })
        .await;

        Ok(StackReport {
            stack: stack.name.clone(),
            deployment_id,
            changes: attempt.changes,
            outputs,
        })
    }

    /// Dry-run diff of a stack against its deployed state.
    ///
    /// Imports not yet published and attributes of resources not yet created
    /// are treated as known after apply.
    pub async fn plan(&self, stack: &Stack) -> Result<PlanSummary> {
        let state = self.state.lock().await;
        let previous = state.get(&stack.name);
        let materialized = previous.map(DeployedStack::materialized).unwrap_or_default();

        let desired: Vec<(&Resource, Option<Resource>)> = stack
            .resources
            .iter()
            .map(|resource| {
                let resolved = resource
                    .resolve(|value| match value {
                        ValueRef::Import(name) => self.channel.resolve(name).map(ValueRef::Literal),
                        other => resolve_attribute(other, &materialized),
                    })
                    .ok();
                (resource, resolved)
            })
            .collect();

        Ok(plan::diff(&stack.name, &desired, previous))
    }

    /// Destroy a deployed stack.
    ///
    /// Refused with `Conflict` while another deployed stack imports one of
    /// its exports. Resources are deleted in reverse definition order;
    /// retained resources are left in place.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(deployed) = state.get(name).cloned() else {
            return Err(Error::NotFound(format!("stack '{}' is not deployed", name)));
        };

        for export in deployed.exports() {
            let importers: Vec<String> = self
                .channel
                .importers_of(export)?
                .into_iter()
                .filter(|s| s != name)
                .collect();
            if !importers.is_empty() {
                return Err(Error::conflict(
                    export,
                    format!(
                        "stack '{}' cannot be destroyed while imported by {}",
                        name,
                        importers.join(", ")
                    ),
                ));
            }
        }

        info!(stack = %name, provider = self.provider.name(), "Destroying stack");
        let mut remaining = deployed.resources.clone();
        while let Some(resource) = remaining.last() {
            match resource.definition.removal_policy() {
                RemovalPolicy::Retain => {
                    info!(stack = %name, resource = %resource.logical_id(), "Retaining resource");
                }
                RemovalPolicy::Destroy { .. } => {
                    let result = self
                        .provider
                        .delete(&deployed.env, name, &resource.definition, &resource.materialized)
                        .await;
                    if let Err(e) = result {
                        error!(stack = %name, resource = %resource.logical_id(), error = %e, "Delete failed");
                        if let Some(stack) = state.stacks.get_mut(name) {
                            stack.resources = remaining;
                        }
                        return Err(e);
                    }
                }
            }
            remaining.pop();
        }

        self.channel.retract(name)?;
        state.stacks.remove(name);
        info!(stack = %name, "Stack destroyed");
        Ok(())
    }

    fn bind_imports(&self, stack: &Stack) -> Result<Vec<Resource>> {
        for output in &stack.outputs {
            if let ValueRef::Import(export) = &output.value {
                self.channel.resolve_for(&stack.name, export)?;
            }
        }
        stack
            .resources
            .iter()
            .map(|r| r.bind_imports(&self.channel, &stack.name))
            .collect()
    }

    /// Apply changed resources in dependency waves, then resolve outputs and
    /// publish exports.
    async fn run_attempt(
        &self,
        stack: &Stack,
        bound: &[Resource],
        previous: Option<&DeployedStack>,
        attempt: &mut Attempt,
    ) -> Result<Vec<ResolvedOutput>> {
        for wave in waves(bound)? {
            let mut pending = Vec::new();
            for idx in wave {
                let resolved = bound[idx].resolve(|v| resolve_attribute(v, &attempt.materialized))?;
                let current = previous.and_then(|p| p.resource(resolved.logical_id()));
                match current {
                    Some(deployed) if deployed.definition == resolved => {
                        attempt
                            .resources
                            .insert(resolved.logical_id().to_string(), deployed.clone());
                    }
                    _ => pending.push((resolved, current.cloned())),
                }
            }

            let results = join_all(pending.iter().map(|(resource, current)| {
                self.provider.apply(
                    &stack.env,
                    &stack.name,
                    resource,
                    current.as_ref().map(|c| &c.materialized),
                )
            }))
            .await;

            let mut failure = None;
            for ((resource, current), result) in pending.into_iter().zip(results) {
                let materialized = match result {
                    Ok(m) => m,
                    Err(e) => {
                        error!(
                            stack = %stack.name,
                            resource = %resource.logical_id(),
                            error = %e,
                            "Apply failed"
                        );
                        failure.get_or_insert(e);
                        continue;
                    }
                };

                let action = if current.is_some() {
                    ChangeAction::Update
                } else {
                    ChangeAction::Create
                };
                attempt
                    .changes
                    .record(ResourceChange::new(&resource, action));
                self.emit(DeploymentEvent::ResourceApplied {
                    stack: stack.name.clone(),
                    logical_id: resource.logical_id().to_string(),
                    action,
                })
                .await;

                let id = resource.logical_id().to_string();
                attempt.materialized.insert(id.clone(), materialized.clone());
                attempt.journal.push(match current {
                    Some(previous) => Applied::Updated {
                        previous,
                        materialized: materialized.clone(),
                    },
                    None => Applied::Created {
                        resource: resource.clone(),
                        materialized: materialized.clone(),
                    },
                });
                attempt.resources.insert(
                    id,
                    DeployedResource {
                        definition: resource,
                        materialized,
                    },
                );
            }

            if let Some(e) = failure {
                return Err(e);
            }
        }

        let outputs = stack
            .outputs
            .iter()
            .map(|output| {
                let value = match &output.value {
                    ValueRef::Import(export) => self.channel.resolve_for(&stack.name, export)?,
                    other => match resolve_attribute(other, &attempt.materialized)? {
                        ValueRef::Literal(v) => v,
                        unresolved => {
                            return Err(Error::Internal(format!(
                                "output '{}' left unresolved: {}",
                                output.key, unresolved
                            )));
                        }
                    },
                };
                Ok(ResolvedOutput {
                    key: output.key.clone(),
                    value,
                    description: output.description.clone(),
                    export_name: output.export_name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(previous) = previous {
            let declared: BTreeSet<&str> = stack.exports().into_iter().collect();
            for export in previous.exports().filter(|e| !declared.contains(e)) {
                self.channel.withdraw(&stack.name, export)?;
            }
        }
        for output in &outputs {
            if let Some(export) = &output.export_name {
                self.channel.publish(&stack.name, export, &output.value)?;
            }
        }

        Ok(outputs)
    }

    /// Delete resources dropped from the definition. Returns the ids that
    /// stay recorded: failed deletions, to be retried on the next deploy.
    async fn remove_dropped(
        &self,
        stack: &Stack,
        bound: &[Resource],
        previous: Option<&DeployedStack>,
        attempt: &mut Attempt,
    ) -> Vec<String> {
        let mut kept = Vec::new();
        for deployed in plan::removed(bound.iter(), previous).into_iter().rev() {
            let action = plan::removal_action(&deployed.definition);
            if action == ChangeAction::Delete {
                let result = self
                    .provider
                    .delete(&stack.env, &stack.name, &deployed.definition, &deployed.materialized)
                    .await;
                if let Err(e) = result {
                    warn!(
                        stack = %stack.name,
                        resource = %deployed.logical_id(),
                        error = %e,
                        "Failed to delete dropped resource"
                    );
                    attempt
                        .resources
                        .insert(deployed.logical_id().to_string(), deployed.clone());
                    kept.push(deployed.logical_id().to_string());
                    continue;
                }
            } else {
                info!(stack = %stack.name, resource = %deployed.logical_id(), "Retaining dropped resource");
            }
            attempt
                .changes
                .record(ResourceChange::new(&deployed.definition, action));
        }
        kept
    }

    async fn roll_back(&self, stack: &Stack, attempt: Attempt, reason: &str) {
        for applied in attempt.journal.into_iter().rev() {
            let result = match &applied {
                Applied::Created {
                    resource,
                    materialized,
                } => {
                    self.provider
                        .delete(&stack.env, &stack.name, resource, materialized)
                        .await
                }
                Applied::Updated {
                    previous,
                    materialized,
                } => self
                    .provider
                    .apply(&stack.env, &stack.name, &previous.definition, Some(materialized))
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                error!(stack = %stack.name, error = %e, "Rollback step failed");
            }
        }

        match self.channel.rollback(&stack.name) {
            Ok(exports) if !exports.is_empty() => {
                info!(stack = %stack.name, ?exports, "Withdrew exports of rolled back stack");
            }
            Ok(_) => {}
            Err(e) => error!(stack = %stack.name, error = %e, "Export rollback failed"),
        }

        warn!(stack = %stack.name, reason, "Stack rolled back");
        self.emit(DeploymentEvent::StackRolledBack {
            stack: stack.name.clone(),
            reason: reason.to_string(),
        })
        .await;
    }
}

fn resolve_attribute(
    value: &ValueRef,
    materialized: &BTreeMap<String, Materialized>,
) -> Result<ValueRef> {
    match value {
        ValueRef::Attribute {
            resource,
            attribute,
        } => materialized
            .get(resource)
            .and_then(|m| m.attribute(attribute))
            .map(ValueRef::literal)
            .ok_or_else(|| Error::NotFound(format!("attribute {}.{}", resource, attribute))),
        other => Ok(other.clone()),
    }
}

/// Group resources into waves; each wave depends only on earlier ones.
fn waves(resources: &[Resource]) -> Result<Vec<Vec<usize>>> {
    let mut level: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<usize>> = Vec::new();

    for (idx, resource) in resources.iter().enumerate() {
        let mut wave = 0;
        for dep in resource.depends_on() {
            let dep_level = level.get(dep).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "resource '{}' depends on '{}', which is not defined before it",
                    resource.logical_id(),
                    dep
                ))
            })?;
            wave = wave.max(dep_level + 1);
        }
        level.insert(resource.logical_id(), wave);
        if waves.len() <= wave {
            waves.resize_with(wave + 1, Vec::new);
        }
        waves[wave].push(idx);
    }

    Ok(waves)
}

/// Topological order of stacks by export/import edges, plus each stack's
/// producers within the set. Imports produced outside the set are left to
/// resolve against already deployed stacks.
fn dependency_order(stacks: &[Stack]) -> Result<(Vec<String>, HashMap<String, Vec<String>>)> {
    let mut producers: HashMap<&str, &str> = HashMap::new();
    for stack in stacks {
        for export in stack.exports() {
            if let Some(other) = producers.insert(export, &stack.name) {
                return Err(Error::conflict(
                    export,
                    format!("exported by both '{}' and '{}'", other, stack.name),
                ));
            }
        }
    }

    let needs: HashMap<String, Vec<String>> = stacks
        .iter()
        .map(|stack| {
            let deps: BTreeSet<String> = stack
                .imports()
                .iter()
                .filter_map(|i| producers.get(i.as_str()))
                .filter(|p| **p != stack.name)
                .map(|p| p.to_string())
                .collect();
            (stack.name.clone(), deps.into_iter().collect())
        })
        .collect();

    let mut order = Vec::new();
    let mut marks: HashMap<String, bool> = HashMap::new();
    for stack in stacks {
        visit(&stack.name, &needs, &mut marks, &mut order)?;
    }
    Ok((order, needs))
}

/// Depth-first visit; a mark of `false` means in progress.
fn visit(
    name: &str,
    needs: &HashMap<String, Vec<String>>,
    marks: &mut HashMap<String, bool>,
    order: &mut Vec<String>,
) -> Result<()> {
    match marks.get(name) {
        Some(true) => return Ok(()),
        Some(false) => {
            return Err(Error::InvalidInput(format!(
                "stack '{}' is part of an import cycle",
                name
            )));
        }
        None => {}
    }

    marks.insert(name.to_string(), false);
    for dep in needs.get(name).into_iter().flatten() {
        visit(dep, needs, marks, order)?;
    }
    marks.insert(name.to_string(), true);
    order.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentstack_core::Environment;
    use agentstack_core::Output;
    use agentstack_core::artifact::Artifact;
    use agentstack_core::resource::{Repository, Runtime};
    use agentstack_deployer::SimulatedProvider;

    const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/Shared";

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1").unwrap()
    }

    fn producer(name: &str, export: &str) -> Stack {
        let mut stack = Stack::new(name, env());
        stack
            .add_resource(Resource::Repository(
                Repository::builder("Repo", format!("{}-repo", name.to_lowercase()))
                    .removal_policy(RemovalPolicy::Destroy {
                        empty_on_delete: true,
                    })
                    .build()
                    .unwrap(),
            ))
            .unwrap();
        stack
            .add_output(Output::new("Uri", ValueRef::attribute("Repo", "RepositoryUri")).export(export))
            .unwrap();
        stack
    }

    fn consumer(name: &str, import: &str) -> Stack {
        let mut stack = Stack::new(name, env());
        stack
            .add_resource(Resource::Runtime(
                Runtime::new(
                    "Runtime",
                    "Agent",
                    ValueRef::import(import),
                    Artifact::from_image("agent:latest"),
                )
                .unwrap(),
            ))
            .unwrap();
        stack
    }

    fn orchestrator() -> (Arc<SimulatedProvider>, Orchestrator) {
        let provider = Arc::new(SimulatedProvider::new());
        let orchestrator = Orchestrator::new(provider.clone(), Arc::new(CrossStackChannel::new()));
        (provider, orchestrator)
    }

    #[test]
    fn test_dependency_order() {
        let stacks = vec![consumer("Runtime", "RoleArn"), producer("Infra", "RoleArn")];
        let (order, needs) = dependency_order(&stacks).unwrap();
        assert_eq!(order, vec!["Infra", "Runtime"]);
        assert_eq!(needs["Runtime"], vec!["Infra"]);
        assert!(needs["Infra"].is_empty());
    }

    #[test]
    fn test_import_cycle_rejected() {
        let mut a = producer("A", "FromA");
        a.add_output(Output::new("In", ValueRef::import("FromB"))).unwrap();
        let mut b = producer("B", "FromB");
        b.add_output(Output::new("In", ValueRef::import("FromA"))).unwrap();

        let result = dependency_order(&[a, b]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let result = dependency_order(&[producer("A", "Same"), producer("B", "Same")]);
        assert!(matches!(result, Err(Error::Conflict { .. })));
    }

    #[test]
    fn test_waves_follow_dependencies() {
        let repo = Resource::Repository(Repository::builder("Repo", "repo").build().unwrap());
        let runtime = Resource::Runtime(
            Runtime::new(
                "Runtime",
                "Agent",
                ValueRef::literal(ROLE_ARN),
                Artifact::from_image("agent:latest"),
            )
            .unwrap()
            .with_repository(ValueRef::attribute("Repo", "Arn")),
        );
        let other = Resource::Repository(Repository::builder("Other", "other").build().unwrap());

        let waves = waves(&[repo, runtime, other]).unwrap();
        assert_eq!(waves, vec![vec![0, 2], vec![1]]);
    }

    #[tokio::test]
    async fn test_name_clash_reports_deploying_stack() {
        let (provider, orchestrator) = orchestrator();
        assert_eq!(orchestrator.provider_name(), "simulated");
        orchestrator.deploy_stack(&producer("A", "FromA")).await.unwrap();

        let mut clash = Stack::new("B", env());
        clash
            .add_resource(Resource::Repository(
                Repository::builder("Repo", "a-repo").build().unwrap(),
            ))
            .unwrap();
        let err = orchestrator.deploy_stack(&clash).await.unwrap_err();

        assert!(matches!(
            err,
            Error::DuplicateResourceName { ref stack, owner: Some(ref owner), .. }
                if stack == "B" && owner == "A"
        ));
        assert!(!orchestrator.state().await.is_deployed("B"));
        assert!(provider.is_live("A", "Repo").unwrap());
    }

    #[tokio::test]
    async fn test_unresolved_import_makes_no_provider_calls() {
        let (provider, orchestrator) = orchestrator();
        let result = orchestrator.deploy_stack(&consumer("Runtime", "Missing")).await;

        assert!(matches!(result, Err(Error::UnresolvedImport { .. })));
        assert_eq!(provider.calls().unwrap().total(), 0);
        assert!(!orchestrator.state().await.is_deployed("Runtime"));
    }

    #[tokio::test]
    async fn test_redeploy_is_idempotent() {
        let (provider, orchestrator) = orchestrator();
        let stack = producer("Infra", "RepoUri");

        let first = orchestrator.deploy_stack(&stack).await.unwrap();
        assert_eq!(first.changes.to_add.len(), 1);
        let calls = provider.calls().unwrap();

        assert!(orchestrator.plan(&stack).await.unwrap().is_empty());
        let second = orchestrator.deploy_stack(&stack).await.unwrap();
        assert!(second.changes.is_empty());
        assert_eq!(provider.calls().unwrap(), calls);
        assert_eq!(first.outputs, second.outputs);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_resources_and_exports() {
        let (provider, orchestrator) = orchestrator();
        let mut stack = producer("Infra", "RepoUri");
        stack
            .add_resource(Resource::Repository(
                Repository::builder("Second", "second").build().unwrap(),
            ))
            .unwrap();
        provider.fail_on("Second").unwrap();

        let result = orchestrator.deploy_stack(&stack).await;
        assert!(matches!(result, Err(Error::DeploymentFailed { .. })));
        assert!(provider.live().unwrap().is_empty());
        assert!(orchestrator.channel().resolve("RepoUri").is_err());
        assert!(!orchestrator.state().await.is_deployed("Infra"));
    }

    #[tokio::test]
    async fn test_consumer_skipped_when_producer_fails() {
        let (tx, mut rx) = mpsc::channel(100);
        let provider = Arc::new(SimulatedProvider::new());
        let orchestrator =
            Orchestrator::new(provider.clone(), Arc::new(CrossStackChannel::new())).with_events(tx);
        provider.fail_on("Repo").unwrap();

        let stacks = vec![producer("Infra", "RoleArn"), consumer("Runtime", "RoleArn")];
        let result = orchestrator.deploy(&stacks).await.unwrap();

        assert!(!result.success);
        assert!(matches!(result.stack_states["Infra"], StackState::Failed { .. }));
        assert!(matches!(result.stack_states["Runtime"], StackState::Skipped { .. }));

        drop(orchestrator);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(e, DeploymentEvent::StackRolledBack { stack, .. } if stack == "Infra")));
        assert!(events.iter().any(|e| matches!(e, DeploymentEvent::StackSkipped { stack, .. } if stack == "Runtime")));
    }

    #[tokio::test]
    async fn test_destroy_refused_while_imported() {
        let (provider, orchestrator) = orchestrator();
        let mut infra = producer("Infra", "RepoUri");
        infra
            .add_output(Output::new("Role", ValueRef::literal(ROLE_ARN)).export("RoleArn"))
            .unwrap();

        let result = orchestrator
            .deploy(&[infra, consumer("Runtime", "RoleArn")])
            .await
            .unwrap();
        assert!(result.success);

        let err = orchestrator.destroy("Infra").await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        orchestrator.destroy("Runtime").await.unwrap();
        orchestrator.destroy("Infra").await.unwrap();
        assert!(provider.live().unwrap().is_empty());
        assert!(orchestrator.channel().resolve("RoleArn").is_err());
    }

    #[tokio::test]
    async fn test_dropped_resource_deleted_and_export_withdrawn() {
        let (provider, orchestrator) = orchestrator();
        let mut stack = producer("Infra", "RepoUri");
        stack
            .add_resource(Resource::Repository(
                Repository::builder("Extra", "extra").build().unwrap(),
            ))
            .unwrap();
        orchestrator.deploy_stack(&stack).await.unwrap();

        let mut smaller = Stack::new("Infra", env());
        smaller
            .add_resource(stack.resource("Repo").unwrap().clone())
            .unwrap();

        let plan = orchestrator.plan(&smaller).await.unwrap();
        assert_eq!(plan.to_destroy.len(), 1);
        assert_eq!(plan.to_destroy[0].action, ChangeAction::Retain);

        let report = orchestrator.deploy_stack(&smaller).await.unwrap();
        assert_eq!(report.changes.to_destroy.len(), 1);
        assert!(orchestrator.channel().resolve("RepoUri").is_err());
        // Retained: still live, no longer tracked.
        assert!(provider.is_live("Infra", "Extra").unwrap());
        let state = orchestrator.state().await;
        assert!(state.get("Infra").unwrap().resource("Extra").is_none());
    }
}
