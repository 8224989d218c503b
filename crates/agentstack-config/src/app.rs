//! App configuration parsing.

use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};
use agentstack_core::Environment;
use agentstack_core::resource::RemovalPolicy;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_APP_NAME: &str = "agentstack";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_FOUNDATION_STACK: &str = "AgentCoreInfra";
pub const DEFAULT_FOUNDATION_DESCRIPTION: &str =
    "AgentCore Infrastructure: Container registry and IAM roles";
pub const DEFAULT_REPOSITORY_NAME: &str = "strands_agent_repository";
pub const DEFAULT_MAX_IMAGES: u32 = 5;
pub const DEFAULT_RUNTIME_STACK: &str = "AgentCoreRuntime";
pub const DEFAULT_AGENT_NAME: &str = "MyAgent";
pub const DEFAULT_ARTIFACT: &str = "agents/agent-python-strands";

/// A complete two-stack app definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub account: Option<String>,
    pub region: Option<String>,
    pub foundation: FoundationConfig,
    pub runtime: Option<RuntimeConfig>,
}

/// Registry and execution identity stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundationConfig {
    pub stack_name: String,
    pub description: Option<String>,
    pub repository_name: String,
    pub max_image_count: u32,
    pub removal_policy: RemovalPolicy,
}

/// Where the runtime's deployable package comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactLocation {
    /// Local build context, relative to the config file.
    Asset(String),
    /// Prebuilt image URI.
    Image(String),
}

/// Agent runtime stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub stack_name: String,
    pub description: Option<String>,
    pub agent_name: String,
    pub artifact: ArtifactLocation,
    /// Export the execution role ARN is imported from.
    pub role_export: Option<String>,
}

impl Default for FoundationConfig {
    fn default() -> Self {
        Self {
            stack_name: DEFAULT_FOUNDATION_STACK.to_string(),
            description: Some(DEFAULT_FOUNDATION_DESCRIPTION.to_string()),
            repository_name: DEFAULT_REPOSITORY_NAME.to_string(),
            max_image_count: DEFAULT_MAX_IMAGES,
            removal_policy: RemovalPolicy::Destroy {
                empty_on_delete: true,
            },
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_name: DEFAULT_RUNTIME_STACK.to_string(),
            description: None,
            agent_name: DEFAULT_AGENT_NAME.to_string(),
            artifact: ArtifactLocation::Asset(DEFAULT_ARTIFACT.to_string()),
            role_export: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_APP_NAME.to_string(),
            account: None,
            region: None,
            foundation: FoundationConfig::default(),
            runtime: Some(RuntimeConfig::default()),
        }
    }
}

impl AppConfig {
    /// Resolve the target environment, falling back to `CDK_DEFAULT_ACCOUNT`
    /// and `CDK_DEFAULT_REGION`, then to the default region.
    pub fn environment(&self, vars: &VariableContext) -> ConfigResult<Environment> {
        let account = self
            .account
            .clone()
            .or_else(|| vars.default_account())
            .ok_or_else(|| ConfigError::MissingField("account".to_string()))?;
        let region = self
            .region
            .clone()
            .or_else(|| vars.default_region())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        Environment::new(account, region).map_err(|e| ConfigError::InvalidValue {
            field: "environment".to_string(),
            message: e.to_string(),
        })
    }
}

/// Parse an app configuration from KDL text, interpolating against the process environment.
pub fn parse_app_config(kdl: &str) -> ConfigResult<AppConfig> {
    parse_app_config_with(kdl, VariableContext::from_process_env())
}

/// Parse an app configuration from KDL text with an explicit variable context.
pub fn parse_app_config_with(kdl: &str, mut vars: VariableContext) -> ConfigResult<AppConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut app_node = None;
    let mut foundation_node = None;
    let mut runtime_node = None;

    for node in doc.nodes() {
        let slot = match node.name().value() {
            "app" => &mut app_node,
            "foundation" => &mut foundation_node,
            "runtime" => &mut runtime_node,
            _ => continue, // Ignore unknown nodes
        };
        if slot.is_some() {
            return Err(ConfigError::Duplicate(format!(
                "'{}' block",
                node.name().value()
            )));
        }
        *slot = Some(node);
    }

    // App name, account and region are interpolated first so later values can use them.
    let mut config = AppConfig {
        runtime: None,
        ..AppConfig::default()
    };
    if let Some(node) = app_node {
        if let Some(name) = get_first_string_arg(node) {
            config.name = vars.interpolate(&name);
        }
        vars.app = Some(config.name.clone());
        config.account = child_string(node, "account", &vars)?;
        config.region = child_string(node, "region", &vars)?;
    } else {
        vars.app = Some(config.name.clone());
    }
    vars.account = config.account.clone().or_else(|| vars.default_account());
    vars.region = config
        .region
        .clone()
        .or_else(|| vars.default_region())
        .or_else(|| Some(DEFAULT_REGION.to_string()));

    let node = foundation_node
        .ok_or_else(|| ConfigError::MissingField("foundation block".to_string()))?;
    config.foundation = parse_foundation(node, &vars)?;
    config.runtime = runtime_node.map(|n| parse_runtime(n, &vars)).transpose()?;

    if let Some(runtime) = &config.runtime {
        if runtime.stack_name == config.foundation.stack_name {
            return Err(ConfigError::Duplicate(format!(
                "stack name '{}'",
                runtime.stack_name
            )));
        }
    }

    Ok(config)
}

fn parse_foundation(node: &KdlNode, vars: &VariableContext) -> ConfigResult<FoundationConfig> {
    let mut foundation = FoundationConfig::default();
    if let Some(name) = get_first_string_arg(node) {
        foundation.stack_name = vars.interpolate(&name);
    }

    if let Some(description) = child_string(node, "description", vars)? {
        foundation.description = Some(description);
    }

    if let Some(repo) = find_child(node, "repository") {
        foundation.repository_name = get_first_string_arg(repo)
            .map(|n| vars.interpolate(&n))
            .ok_or_else(|| ConfigError::MissingField("repository name".to_string()))?;

        if let Some(value) = repo.get("max-images") {
            let count = value
                .as_integer()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: "max-images".to_string(),
                    message: format!("expected a positive integer, got {}", value),
                })?;
            foundation.max_image_count = count;
        }

        if let Some(removal) = get_string_prop(repo, "removal") {
            foundation.removal_policy = match removal.as_str() {
                "destroy" => RemovalPolicy::Destroy {
                    empty_on_delete: true,
                },
                "destroy-keep-images" => RemovalPolicy::Destroy {
                    empty_on_delete: false,
                },
                "retain" => RemovalPolicy::Retain,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "removal".to_string(),
                        message: format!("unknown removal policy: {}", other),
                    });
                }
            };
        }
    }

    warn_unresolved(vars, &foundation.repository_name, "repository");
    Ok(foundation)
}

fn parse_runtime(node: &KdlNode, vars: &VariableContext) -> ConfigResult<RuntimeConfig> {
    let mut runtime = RuntimeConfig::default();
    if let Some(name) = get_first_string_arg(node) {
        runtime.stack_name = vars.interpolate(&name);
    }

    runtime.description = child_string(node, "description", vars)?;
    if let Some(agent_name) = child_string(node, "agent-name", vars)? {
        runtime.agent_name = agent_name;
    }
    let asset = child_string(node, "artifact", vars)?;
    let image = child_string(node, "image", vars)?;
    match (asset, image) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Duplicate(format!(
                "runtime '{}' sets both artifact and image",
                runtime.stack_name
            )));
        }
        (Some(path), None) => {
            warn_unresolved(vars, &path, "artifact");
            runtime.artifact = ArtifactLocation::Asset(path);
        }
        (None, Some(uri)) => {
            warn_unresolved(vars, &uri, "image");
            runtime.artifact = ArtifactLocation::Image(uri);
        }
        (None, None) => {}
    }
    runtime.role_export = child_string(node, "role-export", vars)?;

    Ok(runtime)
}

fn warn_unresolved(vars: &VariableContext, value: &str, field: &str) {
    let unresolved = vars.unresolved_in(value);
    if !unresolved.is_empty() {
        warn!(field, ?unresolved, "Configuration value references unknown variables");
    }
}

// Helper functions for extracting values from KDL nodes

fn find_child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()
        .and_then(|children| children.nodes().iter().find(|c| c.name().value() == name))
}

/// Interpolated first argument of a named child node. A child without a
/// string argument is an error; a missing child is `None`.
fn child_string(
    node: &KdlNode,
    name: &str,
    vars: &VariableContext,
) -> ConfigResult<Option<String>> {
    match find_child(node, name) {
        None => Ok(None),
        Some(child) => get_first_string_arg(child)
            .map(|v| Some(vars.interpolate(&v)))
            .ok_or_else(|| ConfigError::MissingField(format!("value for '{}'", name))),
    }
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}
