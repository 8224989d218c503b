//! In-memory provider with deterministic identifiers.
//!
//! Generated names follow the provider convention of `<stack>-<logical id>-<suffix>`,
//! where the suffix is derived from the account, region, stack and logical id
//! instead of being random. Deploying the same definition twice yields the
//! same ARNs.

use agentstack_core::provider::{Materialized, Provider, attributes};
use agentstack_core::resource::{Resource, ResourceKind};
use agentstack_core::{Environment, Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const MAX_ROLE_NAME: usize = 64;

/// Number of provider calls made so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCalls {
    pub applies: usize,
    pub deletes: usize,
}

impl ProviderCalls {
    pub fn total(&self) -> usize {
        self.applies + self.deletes
    }
}

type Owner = (String, String);

#[derive(Debug, Default)]
struct ProviderState {
    /// Physical names per kind, mapped to the owning (stack, logical id).
    names: HashMap<(ResourceKind, String), Owner>,
    live: BTreeMap<Owner, Materialized>,
    faults: HashSet<String>,
    calls: ProviderCalls,
}

/// Simulated cloud provider.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    state: Mutex<ProviderState>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ProviderState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("provider state lock poisoned".to_string()))
    }

    /// Make every apply of `logical_id` fail until cleared.
    pub fn fail_on(&self, logical_id: impl Into<String>) -> Result<()> {
        self.lock()?.faults.insert(logical_id.into());
        Ok(())
    }

    pub fn clear_faults(&self) -> Result<()> {
        self.lock()?.faults.clear();
        Ok(())
    }

    pub fn calls(&self) -> Result<ProviderCalls> {
        Ok(self.lock()?.calls)
    }

    /// Resources currently materialized, ordered by stack then logical id.
    pub fn live(&self) -> Result<Vec<Materialized>> {
        Ok(self.lock()?.live.values().cloned().collect())
    }

    pub fn is_live(&self, stack: &str, logical_id: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .live
            .contains_key(&(stack.to_string(), logical_id.to_string())))
    }
}

fn suffix(env: &Environment, stack: &str, logical_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(env.account.as_bytes());
    hasher.update(b"/");
    hasher.update(env.region.as_bytes());
    hasher.update(b"/");
    hasher.update(stack.as_bytes());
    hasher.update(b"/");
    hasher.update(logical_id.as_bytes());
    hex::encode_upper(&hasher.finalize()[..6])
}

fn generated_role_name(stack: &str, logical_id: &str, suffix: &str) -> String {
    let prefix_len = MAX_ROLE_NAME - suffix.len() - 1;
    let prefix: String = format!("{}-{}", stack, logical_id)
        .chars()
        .take(prefix_len)
        .collect();
    format!("{}-{}", prefix, suffix)
}

fn materialize(env: &Environment, stack: &str, resource: &Resource) -> Result<Materialized> {
    let logical_id = resource.logical_id();
    let suffix = suffix(env, stack, logical_id);
    let mut attrs = BTreeMap::new();

    let physical_id = match resource {
        Resource::Repository(repo) => {
            attrs.insert(
                attributes::ARN.to_string(),
                env.ecr_repository_arn(&repo.name).to_string(),
            );
            attrs.insert(
                attributes::REPOSITORY_URI.to_string(),
                env.ecr_repository_uri(&repo.name),
            );
            repo.name.clone()
        }
        Resource::Identity(identity) => {
            let role_name = identity
                .role_name
                .clone()
                .unwrap_or_else(|| generated_role_name(stack, logical_id, &suffix));
            attrs.insert(
                attributes::ARN.to_string(),
                env.iam_role_arn(&role_name).to_string(),
            );
            attrs.insert(attributes::ROLE_ID.to_string(), format!("AROA{}", suffix));
            role_name
        }
        Resource::Runtime(runtime) => {
            for value in resource.value_refs() {
                if value.as_literal().is_none() {
                    return Err(Error::InvalidInput(format!(
                        "runtime '{}' submitted with unresolved reference {}",
                        runtime.name, value
                    )));
                }
            }
            resource.validate_literals()?;

            let runtime_id = format!("{}-{}", runtime.name, suffix.to_ascii_lowercase());
            attrs.insert(
                attributes::AGENT_RUNTIME_ARN.to_string(),
                env.arn("bedrock-agentcore", &format!("runtime/{}", runtime_id))
                    .to_string(),
            );
            attrs.insert(attributes::AGENT_RUNTIME_ID.to_string(), runtime_id.clone());
            runtime_id
        }
    };

    Ok(Materialized {
        logical_id: logical_id.to_string(),
        kind: resource.kind(),
        physical_id,
        attributes: attrs,
        updated_at: Utc::now(),
    })
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn apply(
        &self,
        env: &Environment,
        stack: &str,
        resource: &Resource,
        current: Option<&Materialized>,
    ) -> Result<Materialized> {
        // Let concurrently applied resources interleave like real API calls.
        tokio::task::yield_now().await;

        let owner: Owner = (stack.to_string(), resource.logical_id().to_string());
        let mut state = self.lock()?;
        state.calls.applies += 1;

        if state.faults.contains(resource.logical_id()) {
            warn!(stack, resource = %resource.logical_id(), "Injected provider failure");
            return Err(Error::DeploymentFailed {
                stack: stack.to_string(),
                message: format!(
                    "provider rejected {} '{}'",
                    resource.kind(),
                    resource.logical_id()
                ),
            });
        }

        if let Some(name) = resource.physical_name() {
            let key = (resource.kind(), name.to_string());
            if let Some(existing) = state.names.get(&key) {
                if *existing != owner {
                    return Err(Error::DuplicateResourceName {
                        kind: resource.kind().to_string(),
                        name: name.to_string(),
                        stack: stack.to_string(),
                        owner: Some(existing.0.clone()),
                    });
                }
            }
        }

        let materialized = materialize(env, stack, resource)?;

        // A renamed resource releases its old physical name.
        let kind = resource.kind();
        state.names.retain(|(k, _), o| !(*k == kind && *o == owner));
        if let Some(name) = resource.physical_name() {
            state
                .names
                .insert((resource.kind(), name.to_string()), owner.clone());
        }
        state.live.insert(owner, materialized.clone());

        info!(
            stack,
            resource = %materialized.logical_id,
            kind = %materialized.kind,
            physical_id = %materialized.physical_id,
            updated = current.is_some(),
            "Applied resource"
        );
        Ok(materialized)
    }

    async fn delete(
        &self,
        _env: &Environment,
        stack: &str,
        resource: &Resource,
        materialized: &Materialized,
    ) -> Result<()> {
        tokio::task::yield_now().await;

        let owner: Owner = (stack.to_string(), materialized.logical_id.clone());
        let mut state = self.lock()?;
        state.calls.deletes += 1;

        if state.live.remove(&owner).is_none() {
            debug!(stack, resource = %materialized.logical_id, "Resource already gone");
        }
        state.names.retain(|(kind, _), o| !(*kind == resource.kind() && *o == owner));

        info!(
            stack,
            resource = %materialized.logical_id,
            physical_id = %materialized.physical_id,
            "Deleted resource"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentstack_core::ValueRef;
    use agentstack_core::artifact::Artifact;
    use agentstack_core::resource::{Identity, Repository, Runtime};

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1").unwrap()
    }

    fn repository(name: &str) -> Resource {
        Resource::Repository(Repository::builder("AgentRepository", name).build().unwrap())
    }

    fn runtime(role: ValueRef) -> Resource {
        Resource::Runtime(
            Runtime::new("AgentRuntime", "MyAgent", role, Artifact::from_image("agent:latest"))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_repository_attributes() {
        let provider = SimulatedProvider::new();
        let m = provider
            .apply(&env(), "Infra", &repository("strands_agent_repository"), None)
            .await
            .unwrap();

        assert_eq!(m.physical_id, "strands_agent_repository");
        assert_eq!(
            m.attribute(attributes::REPOSITORY_URI),
            Some("123456789012.dkr.ecr.us-east-1.amazonaws.com/strands_agent_repository")
        );
        assert_eq!(
            m.attribute(attributes::ARN),
            Some("arn:aws:ecr:us-east-1:123456789012:repository/strands_agent_repository")
        );
    }

    #[tokio::test]
    async fn test_role_arn_is_deterministic() {
        let role = Resource::Identity(Identity::builder("AgentRuntimeRole").build());
        let first = SimulatedProvider::new()
            .apply(&env(), "AgentCoreInfra", &role, None)
            .await
            .unwrap();
        let second = SimulatedProvider::new()
            .apply(&env(), "AgentCoreInfra", &role, None)
            .await
            .unwrap();

        assert_eq!(first.attributes, second.attributes);
        let arn = first.attribute(attributes::ARN).unwrap();
        assert!(arn.starts_with("arn:aws:iam::123456789012:role/AgentCoreInfra-AgentRuntimeRole-"));
    }

    #[test]
    fn test_generated_role_name_is_bounded() {
        let name = generated_role_name(&"S".repeat(80), "AgentRuntimeRole", "0123456789AB");
        assert_eq!(name.len(), MAX_ROLE_NAME);
        assert!(name.ends_with("-0123456789AB"));
    }

    #[tokio::test]
    async fn test_runtime_requires_literal_role() {
        let provider = SimulatedProvider::new();
        let result = provider
            .apply(&env(), "Runtime", &runtime(ValueRef::import("RoleArn")), None)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(!provider.is_live("Runtime", "AgentRuntime").unwrap());
    }

    #[tokio::test]
    async fn test_runtime_arn() {
        let provider = SimulatedProvider::new();
        let m = provider
            .apply(
                &env(),
                "AgentCoreRuntime",
                &runtime(ValueRef::literal("arn:aws:iam::123456789012:role/r")),
                None,
            )
            .await
            .unwrap();

        let arn = m.attribute(attributes::AGENT_RUNTIME_ARN).unwrap();
        assert!(arn.starts_with("arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/MyAgent-"));
        assert!(m.attribute(attributes::AGENT_RUNTIME_ID).unwrap().starts_with("MyAgent-"));
    }

    #[tokio::test]
    async fn test_physical_name_unique_across_stacks() {
        let provider = SimulatedProvider::new();
        provider
            .apply(&env(), "StackA", &repository("shared"), None)
            .await
            .unwrap();

        let err = provider
            .apply(&env(), "StackB", &repository("shared"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateResourceName { ref name, ref stack, owner: Some(ref owner), .. }
                if name == "shared" && stack == "StackB" && owner == "StackA"
        ));
        assert_eq!(
            err.to_string(),
            "duplicate AWS::ECR::Repository name 'shared' in stack 'StackB', \
             already owned by stack 'StackA'"
        );
    }

    #[tokio::test]
    async fn test_delete_releases_name() {
        let provider = SimulatedProvider::new();
        let repo = repository("shared");
        let m = provider.apply(&env(), "StackA", &repo, None).await.unwrap();
        provider.delete(&env(), "StackA", &repo, &m).await.unwrap();

        assert!(provider.live().unwrap().is_empty());
        assert!(provider.apply(&env(), "StackB", &repo, None).await.is_ok());
        assert_eq!(
            provider.calls().unwrap(),
            ProviderCalls {
                applies: 2,
                deletes: 1
            }
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let provider = SimulatedProvider::new();
        provider.fail_on("AgentRepository").unwrap();

        let result = provider.apply(&env(), "Infra", &repository("repo"), None).await;
        assert!(matches!(result, Err(Error::DeploymentFailed { .. })));
        assert!(provider.live().unwrap().is_empty());

        provider.clear_faults().unwrap();
        assert!(provider.apply(&env(), "Infra", &repository("repo"), None).await.is_ok());
        assert_eq!(provider.calls().unwrap().applies, 2);
    }

    #[tokio::test]
    async fn test_materialized_serializes() {
        let provider = SimulatedProvider::new();
        let m = provider
            .apply(&env(), "Infra", &repository("repo"), None)
            .await
            .unwrap();
        let json = serde_json::to_string(&m).unwrap();
        let back: Materialized = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
