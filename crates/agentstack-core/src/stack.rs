//! Stacks, outputs and value references.
//!
//! A stack is plain data: a named list of resources plus declared outputs.
//! Cross-stack imports are recorded as [`ValueRef::Import`] intents and only
//! resolved when the stack is deployed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;

use crate::arn::Environment;
use crate::artifact::ArtifactSource;
use crate::policy::EffectivePermissions;
use crate::resource::{RemovalPolicy, Resource};
use crate::{Error, Result};

/// A value that may not be known until deploy time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRef {
    /// Known at definition time.
    Literal(String),
    /// Export published by another stack, looked up through the channel.
    Import(String),
    /// Attribute of a resource in the same stack, known once it is materialized.
    Attribute { resource: String, attribute: String },
}

impl ValueRef {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn import(export: impl Into<String>) -> Self {
        Self::Import(export.into())
    }

    pub fn attribute(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Attribute {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            ValueRef::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Template rendering using the provider's intrinsic functions.
    pub fn to_template(&self) -> Value {
        match self {
            ValueRef::Literal(v) => Value::String(v.clone()),
            ValueRef::Import(name) => json!({ "Fn::ImportValue": name }),
            ValueRef::Attribute {
                resource,
                attribute,
            } => json!({ "Fn::GetAtt": [resource, attribute] }),
        }
    }
}

impl std::fmt::Display for ValueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueRef::Literal(v) => write!(f, "{}", v),
            ValueRef::Import(name) => write!(f, "${{import:{}}}", name),
            ValueRef::Attribute {
                resource,
                attribute,
            } => write!(f, "${{{}.{}}}", resource, attribute),
        }
    }
}

/// A declared stack output, optionally exported under a global name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub key: String,
    pub value: ValueRef,
    pub description: String,
    pub export_name: Option<String>,
}

impl Output {
    pub fn new(key: impl Into<String>, value: ValueRef) -> Self {
        Self {
            key: key.into(),
            value,
            description: String::new(),
            export_name: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn export(mut self, name: impl Into<String>) -> Self {
        self.export_name = Some(name.into());
        self
    }
}

/// Output value after deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOutput {
    pub key: String,
    pub value: String,
    pub description: String,
    pub export_name: Option<String>,
}

/// A named, independently deployable unit of resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,
    pub description: Option<String>,
    pub env: Environment,
    pub resources: Vec<Resource>,
    pub outputs: Vec<Output>,
}

impl Stack {
    pub fn new(name: impl Into<String>, env: Environment) -> Self {
        Self {
            name: name.into(),
            description: None,
            env,
            resources: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a resource. Re-adding an identical definition is a no-op; a
    /// different definition under a taken logical id or physical name is rejected.
    pub fn add_resource(&mut self, resource: Resource) -> Result<()> {
        if let Some(existing) = self.resource(resource.logical_id()) {
            if *existing == resource {
                return Ok(());
            }
            return Err(Error::DuplicateResourceName {
                kind: resource.kind().to_string(),
                name: resource.logical_id().to_string(),
                stack: self.name.clone(),
                owner: None,
            });
        }

        if let Some(physical) = resource.physical_name() {
            let clash = self.resources.iter().any(|r| {
                r.kind() == resource.kind() && r.physical_name() == Some(physical)
            });
            if clash {
                return Err(Error::DuplicateResourceName {
                    kind: resource.kind().to_string(),
                    name: physical.to_string(),
                    stack: self.name.clone(),
                    owner: None,
                });
            }
        }

        for dep in resource.depends_on() {
            if self.resource(dep).is_none() {
                return Err(Error::InvalidInput(format!(
                    "resource '{}' in stack '{}' references unknown resource '{}'",
                    resource.logical_id(),
                    self.name,
                    dep
                )));
            }
        }

        self.resources.push(resource);
        Ok(())
    }

    pub fn add_output(&mut self, output: Output) -> Result<()> {
        if self.outputs.iter().any(|o| o.key == output.key) {
            return Err(Error::InvalidInput(format!(
                "duplicate output '{}' in stack '{}'",
                output.key, self.name
            )));
        }

        if let Some(export) = &output.export_name {
            if self
                .outputs
                .iter()
                .any(|o| o.export_name.as_ref() == Some(export))
            {
                return Err(Error::conflict(
                    export.clone(),
                    format!("exported twice by stack '{}'", self.name),
                ));
            }
        }

        if let ValueRef::Attribute { resource, .. } = &output.value {
            if self.resource(resource).is_none() {
                return Err(Error::InvalidInput(format!(
                    "output '{}' in stack '{}' references unknown resource '{}'",
                    output.key, self.name, resource
                )));
            }
        }

        self.outputs.push(output);
        Ok(())
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.logical_id() == logical_id)
    }

    /// Export names this stack consumes. The stack implicitly depends on their producers.
    pub fn imports(&self) -> BTreeSet<String> {
        let from_resources = self.resources.iter().flat_map(|r| r.imports());
        let from_outputs = self.outputs.iter().filter_map(|o| match &o.value {
            ValueRef::Import(name) => Some(name.as_str()),
            _ => None,
        });
        from_resources
            .chain(from_outputs)
            .map(str::to_string)
            .collect()
    }

    /// Export names this stack publishes.
    pub fn exports(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .filter_map(|o| o.export_name.as_deref())
            .collect()
    }

    /// Render the stack as a provider template document.
    pub fn template(&self) -> Value {
        let mut resources = Map::new();
        for resource in &self.resources {
            resources.insert(resource.logical_id().to_string(), render_resource(resource));
        }

        let mut outputs = Map::new();
        for output in &self.outputs {
            let mut rendered = json!({
                "Value": output.value.to_template(),
                "Description": output.description,
            });
            if let Some(export) = &output.export_name {
                rendered["Export"] = json!({ "Name": export });
            }
            outputs.insert(output.key.clone(), rendered);
        }

        let mut template = json!({
            "Resources": resources,
            "Outputs": outputs,
        });
        if let Some(description) = &self.description {
            template["Description"] = json!(description);
        }
        template
    }
}

fn render_resource(resource: &Resource) -> Value {
    let (properties, deletion) = match resource {
        Resource::Repository(repo) => {
            let rules: Vec<Value> = repo
                .lifecycle_rules
                .iter()
                .enumerate()
                .map(|(i, rule)| {
                    json!({
                        "rulePriority": i + 1,
                        "description": rule.description,
                        "selection": {
                            "tagStatus": "any",
                            "countType": "imageCountMoreThan",
                            "countNumber": rule.max_image_count,
                        },
                        "action": { "type": "expire" },
                    })
                })
                .collect();

            let mut props = json!({ "RepositoryName": repo.name });
            if !rules.is_empty() {
                props["LifecyclePolicy"] = json!({
                    "LifecyclePolicyText": json!({ "rules": rules }).to_string(),
                });
            }
            if let RemovalPolicy::Destroy {
                empty_on_delete: true,
            } = repo.removal_policy
            {
                props["EmptyOnDelete"] = json!(true);
            }
            (props, repo.removal_policy)
        }
        Resource::Identity(identity) => {
            let permissions = EffectivePermissions::of(identity);
            let mut props = json!({
                "AssumeRolePolicyDocument": identity.trust_policy(),
            });
            if let Some(description) = &identity.description {
                props["Description"] = json!(description);
            }
            if let Some(role_name) = &identity.role_name {
                props["RoleName"] = json!(role_name);
            }
            if !permissions.document.statement.is_empty() {
                props["Policies"] = json!([{
                    "PolicyName": format!("{}DefaultPolicy", identity.name),
                    "PolicyDocument": permissions.document,
                }]);
            }
            if !permissions.managed_policy_arns.is_empty() {
                props["ManagedPolicyArns"] = json!(permissions.managed_policy_arns);
            }
            (props, resource.removal_policy())
        }
        Resource::Runtime(runtime) => {
            let artifact = match &runtime.artifact.source {
                ArtifactSource::Asset { path } => json!({
                    "Asset": path.display().to_string(),
                    "Digest": runtime.artifact.digest,
                }),
                ArtifactSource::Image { uri } => json!({
                    "ContainerUri": uri,
                    "Digest": runtime.artifact.digest,
                }),
            };
            let mut props = json!({
                "AgentRuntimeName": runtime.name,
                "RoleArn": runtime.execution_role.to_template(),
                "AgentRuntimeArtifact": artifact,
            });
            if let Some(description) = &runtime.description {
                props["Description"] = json!(description);
            }
            if let Some(repository) = &runtime.repository {
                props["Repository"] = repository.to_template();
            }
            (props, resource.removal_policy())
        }
    };

    let mut rendered = json!({
        "Type": resource.kind().to_string(),
        "Properties": properties,
    });
    let depends_on = resource.depends_on();
    if !depends_on.is_empty() {
        rendered["DependsOn"] = json!(depends_on);
    }
    if deletion == RemovalPolicy::Retain {
        rendered["DeletionPolicy"] = json!("Retain");
        rendered["UpdateReplacePolicy"] = json!("Retain");
    } else {
        rendered["DeletionPolicy"] = json!("Delete");
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::resource::{LifecycleRule, Repository, Runtime};

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1").unwrap()
    }

    fn repo(name: &str) -> Resource {
        Resource::Repository(
            Repository::builder("AgentRepository", name)
                .lifecycle_rule(LifecycleRule::keep_last(5))
                .removal_policy(RemovalPolicy::Destroy {
                    empty_on_delete: true,
                })
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_identical_resource_is_noop() {
        let mut stack = Stack::new("Infra", env());
        stack.add_resource(repo("agents")).unwrap();
        stack.add_resource(repo("agents")).unwrap();
        assert_eq!(stack.resources.len(), 1);
    }

    #[test]
    fn test_conflicting_resource_rejected() {
        let mut stack = Stack::new("Infra", env());
        stack.add_resource(repo("agents")).unwrap();
        let err = stack.add_resource(repo("other")).unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateResourceName { ref name, ref stack, .. }
                if name == "AgentRepository" && stack == "Infra"
        ));
    }

    #[test]
    fn test_physical_name_clash_rejected() {
        let mut stack = Stack::new("Infra", env());
        stack.add_resource(repo("agents")).unwrap();
        let second = Resource::Repository(
            Repository::builder("SecondRepository", "agents")
                .build()
                .unwrap(),
        );
        assert!(matches!(
            stack.add_resource(second),
            Err(Error::DuplicateResourceName { .. })
        ));
    }

    #[test]
    fn test_output_must_reference_known_resource() {
        let mut stack = Stack::new("Infra", env());
        let result = stack.add_output(Output::new(
            "RepositoryUri",
            ValueRef::attribute("Missing", "RepositoryUri"),
        ));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_duplicate_export_in_stack() {
        let mut stack = Stack::new("Infra", env());
        stack
            .add_output(Output::new("A", ValueRef::literal("1")).export("Shared"))
            .unwrap();
        let result = stack.add_output(Output::new("B", ValueRef::literal("2")).export("Shared"));
        assert!(matches!(result, Err(Error::Conflict { .. })));
    }

    #[test]
    fn test_imports_collected() {
        let mut stack = Stack::new("Runtime", env());
        let runtime = Runtime::new(
            "AgentRuntime",
            "MyAgent",
            ValueRef::import("AgentCoreRuntimeRoleArn"),
            Artifact::from_image("repo:latest"),
        )
        .unwrap();
        stack.add_resource(Resource::Runtime(runtime)).unwrap();

        let imports: Vec<_> = stack.imports().into_iter().collect();
        assert_eq!(imports, vec!["AgentCoreRuntimeRoleArn"]);
        assert!(stack.exports().is_empty());
    }

    #[test]
    fn test_template_rendering() {
        let mut stack = Stack::new("Infra", env()).with_description("Registry");
        stack.add_resource(repo("agents")).unwrap();
        stack
            .add_output(
                Output::new(
                    "RepositoryUri",
                    ValueRef::attribute("AgentRepository", "RepositoryUri"),
                )
                .description("ECR Repository URI")
                .export("RepoUri"),
            )
            .unwrap();

        let template = stack.template();
        assert_eq!(template["Description"], "Registry");
        let repo = &template["Resources"]["AgentRepository"];
        assert_eq!(repo["Type"], "AWS::ECR::Repository");
        assert_eq!(repo["Properties"]["EmptyOnDelete"], true);
        assert_eq!(repo["DeletionPolicy"], "Delete");

        let policy: Value = serde_json::from_str(
            repo["Properties"]["LifecyclePolicy"]["LifecyclePolicyText"]
                .as_str()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(policy["rules"][0]["selection"]["countNumber"], 5);

        let output = &template["Outputs"]["RepositoryUri"];
        assert_eq!(
            output["Value"]["Fn::GetAtt"],
            json!(["AgentRepository", "RepositoryUri"])
        );
        assert_eq!(output["Export"]["Name"], "RepoUri");
    }
}
