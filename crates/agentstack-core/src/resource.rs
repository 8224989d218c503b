//! Resource definitions: container repository, execution identity and agent runtime.
//!
//! Construction functions return the resource they build; nothing registers
//! itself with a parent scope. A [`Stack`](crate::Stack) owns resources by value.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::arn::Arn;
use crate::artifact::Artifact;
use crate::exports::CrossStackChannel;
use crate::policy::{ManagedPolicyRef, PermissionStatement, POLICY_VERSION};
use crate::stack::ValueRef;
use crate::{Error, Result};

static REPOSITORY_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9]+(?:[._-][a-z0-9]+)*/)*[a-z0-9]+(?:[._-][a-z0-9]+)*$")
        .expect("repository name regex is valid")
});

static RUNTIME_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]{0,47}$").expect("runtime name regex is valid")
});

/// Resource type, rendered with the provider's type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Repository,
    Identity,
    Runtime,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Repository => write!(f, "AWS::ECR::Repository"),
            ResourceKind::Identity => write!(f, "AWS::IAM::Role"),
            ResourceKind::Runtime => write!(f, "AWS::BedrockAgentCore::Runtime"),
        }
    }
}

/// What happens to the physical resource when its stack is destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Delete the resource; optionally empty it first so deletion cannot fail on contents.
    Destroy { empty_on_delete: bool },
    /// Leave the resource in place and forget it.
    #[default]
    Retain,
}

/// Image retention rule for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub max_image_count: u32,
    pub description: String,
}

impl LifecycleRule {
    pub fn keep_last(count: u32) -> Self {
        Self {
            max_image_count: count,
            description: format!("Keep only {} most recent images", count),
        }
    }
}

/// Container registry repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub logical_id: String,
    /// Unique within account/region.
    pub name: String,
    pub lifecycle_rules: Vec<LifecycleRule>,
    pub removal_policy: RemovalPolicy,
}

impl Repository {
    pub fn builder(logical_id: impl Into<String>, name: impl Into<String>) -> RepositoryBuilder {
        RepositoryBuilder {
            repo: Repository {
                logical_id: logical_id.into(),
                name: name.into(),
                lifecycle_rules: Vec::new(),
                removal_policy: RemovalPolicy::default(),
            },
        }
    }
}

pub struct RepositoryBuilder {
    repo: Repository,
}

impl RepositoryBuilder {
    pub fn lifecycle_rule(mut self, rule: LifecycleRule) -> Self {
        self.repo.lifecycle_rules.push(rule);
        self
    }

    pub fn removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.repo.removal_policy = policy;
        self
    }

    pub fn build(self) -> Result<Repository> {
        let name = &self.repo.name;
        if name.len() < 2 || name.len() > 256 || !REPOSITORY_NAME_REGEX.is_match(name) {
            return Err(Error::InvalidInput(format!(
                "invalid repository name '{}'",
                name
            )));
        }
        if let Some(rule) = self
            .repo
            .lifecycle_rules
            .iter()
            .find(|r| r.max_image_count == 0)
        {
            return Err(Error::InvalidInput(format!(
                "lifecycle rule '{}' must keep at least one image",
                rule.description
            )));
        }
        Ok(self.repo)
    }
}

/// Who may assume an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    Service(String),
    Account(String),
}

impl Principal {
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(name.into())
    }
}

/// An assumable execution principal with its permission set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Logical name within the stack.
    pub name: String,
    /// Explicit physical role name; generated by the provider when absent.
    pub role_name: Option<String>,
    pub trusted_principal: Option<Principal>,
    pub description: Option<String>,
    pub statements: Vec<PermissionStatement>,
    pub managed_policies: Vec<ManagedPolicyRef>,
}

impl Identity {
    pub fn builder(name: impl Into<String>) -> IdentityBuilder {
        IdentityBuilder {
            identity: Identity {
                name: name.into(),
                role_name: None,
                trusted_principal: None,
                description: None,
                statements: Vec::new(),
                managed_policies: Vec::new(),
            },
        }
    }

    /// Assume-role trust policy for the trusted principal.
    pub fn trust_policy(&self) -> serde_json::Value {
        let principal = match &self.trusted_principal {
            Some(Principal::Service(service)) => serde_json::json!({ "Service": service }),
            Some(Principal::Account(account)) => {
                serde_json::json!({ "AWS": format!("arn:aws:iam::{}:root", account) })
            }
            None => return serde_json::json!({ "Version": POLICY_VERSION, "Statement": [] }),
        };

        serde_json::json!({
            "Version": POLICY_VERSION,
            "Statement": [{
                "Effect": "Allow",
                "Principal": principal,
                "Action": "sts:AssumeRole"
            }]
        })
    }
}

pub struct IdentityBuilder {
    identity: Identity,
}

impl IdentityBuilder {
    pub fn assumed_by(mut self, principal: Principal) -> Self {
        self.identity.trusted_principal = Some(principal);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.identity.description = Some(description.into());
        self
    }

    pub fn role_name(mut self, role_name: impl Into<String>) -> Self {
        self.identity.role_name = Some(role_name.into());
        self
    }

    /// Build the identity with an empty permission set.
    /// Statements are attached through the [`PolicyAssembler`](crate::PolicyAssembler).
    pub fn build(self) -> Identity {
        self.identity
    }
}

/// Deployed execution unit binding one identity and one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    pub logical_id: String,
    pub name: String,
    pub description: Option<String>,
    pub execution_role: ValueRef,
    pub artifact: Artifact,
    /// Repository the runtime pulls images from, when the artifact is an image.
    pub repository: Option<ValueRef>,
}

impl Runtime {
    pub fn new(
        logical_id: impl Into<String>,
        name: impl Into<String>,
        execution_role: ValueRef,
        artifact: Artifact,
    ) -> Result<Self> {
        let name = name.into();
        if !RUNTIME_NAME_REGEX.is_match(&name) {
            return Err(Error::InvalidInput(format!(
                "invalid runtime name '{}': must start with a letter and contain only letters, digits and underscores (max 48)",
                name
            )));
        }

        Ok(Self {
            logical_id: logical_id.into(),
            name,
            description: None,
            execution_role,
            artifact,
            repository: None,
        })
    }

    pub fn with_repository(mut self, repository: ValueRef) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Any resource a stack can own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Repository(Repository),
    Identity(Identity),
    Runtime(Runtime),
}

impl Resource {
    pub fn logical_id(&self) -> &str {
        match self {
            Resource::Repository(r) => &r.logical_id,
            Resource::Identity(i) => &i.name,
            Resource::Runtime(r) => &r.logical_id,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Repository(_) => ResourceKind::Repository,
            Resource::Identity(_) => ResourceKind::Identity,
            Resource::Runtime(_) => ResourceKind::Runtime,
        }
    }

    /// Physical name, when the definition fixes one.
    pub fn physical_name(&self) -> Option<&str> {
        match self {
            Resource::Repository(r) => Some(&r.name),
            Resource::Identity(i) => i.role_name.as_deref(),
            Resource::Runtime(r) => Some(&r.name),
        }
    }

    pub fn removal_policy(&self) -> RemovalPolicy {
        match self {
            Resource::Repository(r) => r.removal_policy,
            Resource::Identity(_) | Resource::Runtime(_) => {
                RemovalPolicy::Destroy { empty_on_delete: false }
            }
        }
    }

    pub fn value_refs(&self) -> Vec<&ValueRef> {
        match self {
            Resource::Repository(_) | Resource::Identity(_) => Vec::new(),
            Resource::Runtime(r) => std::iter::once(&r.execution_role)
                .chain(r.repository.as_ref())
                .collect(),
        }
    }

    /// Export names this resource imports.
    pub fn imports(&self) -> Vec<&str> {
        self.value_refs()
            .into_iter()
            .filter_map(|v| match v {
                ValueRef::Import(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Logical ids of resources in the same stack this one reads attributes from.
    pub fn depends_on(&self) -> Vec<&str> {
        self.value_refs()
            .into_iter()
            .filter_map(|v| match v {
                ValueRef::Attribute { resource, .. } => Some(resource.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Rewrite every value reference through `lookup`.
    pub fn resolve<F>(&self, mut lookup: F) -> Result<Resource>
    where
        F: FnMut(&ValueRef) -> Result<ValueRef>,
    {
        match self {
            Resource::Runtime(runtime) => {
                let mut resolved = runtime.clone();
                resolved.execution_role = lookup(&runtime.execution_role)?;
                if let Some(repository) = &runtime.repository {
                    resolved.repository = Some(lookup(repository)?);
                }
                Ok(Resource::Runtime(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve every import through the channel on behalf of `stack`.
    ///
    /// Fails with `UnresolvedImport` before anything is materialized, so a
    /// runtime can never be submitted with an unresolved execution role.
    /// Attribute references are left for the deploy waves.
    pub fn bind_imports(&self, channel: &CrossStackChannel, stack: &str) -> Result<Resource> {
        let bound = self.resolve(|value| match value {
            ValueRef::Import(name) => Ok(ValueRef::Literal(channel.resolve_for(stack, name)?)),
            other => Ok(other.clone()),
        })?;
        bound.validate_literals()?;
        Ok(bound)
    }

    /// Check literal references have the shape their field requires.
    pub fn validate_literals(&self) -> Result<()> {
        if let Resource::Runtime(runtime) = self {
            if let Some(role) = runtime.execution_role.as_literal() {
                let arn: Arn = role.parse()?;
                if arn.service != "iam" || !arn.resource.starts_with("role/") {
                    return Err(Error::InvalidInput(format!(
                        "runtime '{}' execution role '{}' is not an IAM role ARN",
                        runtime.name, role
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_builder() {
        let repo = Repository::builder("AgentRepository", "strands_agent_repository")
            .lifecycle_rule(LifecycleRule::keep_last(5))
            .removal_policy(RemovalPolicy::Destroy { empty_on_delete: true })
            .build()
            .unwrap();

        assert_eq!(repo.lifecycle_rules[0].description, "Keep only 5 most recent images");
        assert_eq!(repo.removal_policy, RemovalPolicy::Destroy { empty_on_delete: true });
    }

    #[test]
    fn test_invalid_repository_names() {
        for name in ["A", "Upper_Case", "trailing-", "double//slash"] {
            assert!(
                Repository::builder("Repo", name).build().is_err(),
                "{} should be rejected",
                name
            );
        }
        assert!(Repository::builder("Repo", "team/agents.v2").build().is_ok());
    }

    #[test]
    fn test_lifecycle_must_keep_images() {
        let result = Repository::builder("Repo", "repo")
            .lifecycle_rule(LifecycleRule::keep_last(0))
            .build();
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_trust_policy() {
        let identity = Identity::builder("Role")
            .assumed_by(Principal::service("bedrock-agentcore.amazonaws.com"))
            .build();
        let policy = identity.trust_policy();
        assert_eq!(
            policy["Statement"][0]["Principal"]["Service"],
            "bedrock-agentcore.amazonaws.com"
        );
        assert_eq!(policy["Statement"][0]["Action"], "sts:AssumeRole");
    }

    #[test]
    fn test_runtime_name_validation() {
        let artifact = Artifact::from_image("repo:latest");
        assert!(Runtime::new("R", "MyAgent", ValueRef::Import("x".into()), artifact.clone()).is_ok());
        assert!(Runtime::new("R", "my-agent", ValueRef::Import("x".into()), artifact.clone()).is_err());
        assert!(Runtime::new("R", "1agent", ValueRef::Import("x".into()), artifact).is_err());
    }

    #[test]
    fn test_runtime_imports_and_dependencies() {
        let runtime = Runtime::new(
            "AgentRuntime",
            "MyAgent",
            ValueRef::Import("AgentCoreRuntimeRoleArn".into()),
            Artifact::from_image("repo:latest"),
        )
        .unwrap()
        .with_repository(ValueRef::attribute("AgentRepository", "Arn"));

        let resource = Resource::Runtime(runtime);
        assert_eq!(resource.imports(), vec!["AgentCoreRuntimeRoleArn"]);
        assert_eq!(resource.depends_on(), vec!["AgentRepository"]);
    }

    #[test]
    fn test_resolve_replaces_refs() {
        let runtime = Runtime::new(
            "AgentRuntime",
            "MyAgent",
            ValueRef::Import("RoleExport".into()),
            Artifact::from_image("repo:latest"),
        )
        .unwrap();

        let resolved = Resource::Runtime(runtime)
            .resolve(|_| Ok(ValueRef::literal("arn:aws:iam::123456789012:role/r")))
            .unwrap();
        assert!(resolved.imports().is_empty());
        match resolved {
            Resource::Runtime(r) => assert_eq!(
                r.execution_role,
                ValueRef::Literal("arn:aws:iam::123456789012:role/r".into())
            ),
            _ => panic!("expected runtime"),
        }
    }

    #[test]
    fn test_bind_imports_unresolved() {
        let runtime = Runtime::new(
            "AgentRuntime",
            "MyAgent",
            ValueRef::import("AgentCoreRuntimeRoleArn"),
            Artifact::from_image("repo:latest"),
        )
        .unwrap();
        let channel = CrossStackChannel::new();

        let err = Resource::Runtime(runtime)
            .bind_imports(&channel, "AgentCoreRuntime")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedImport { ref export, stack: Some(ref s) }
                if export == "AgentCoreRuntimeRoleArn" && s == "AgentCoreRuntime"
        ));
    }

    #[test]
    fn test_bind_imports_rejects_non_role_arn() {
        let runtime = Runtime::new(
            "AgentRuntime",
            "MyAgent",
            ValueRef::import("Role"),
            Artifact::from_image("repo:latest"),
        )
        .unwrap();
        let channel = CrossStackChannel::new();
        channel
            .publish("Infra", "Role", "arn:aws:ecr:us-east-1:123456789012:repository/x")
            .unwrap();

        let result = Resource::Runtime(runtime).bind_imports(&channel, "Runtime");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
