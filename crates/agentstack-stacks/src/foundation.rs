//! Foundation stack: container repository and agent execution role.

use agentstack_config::FoundationConfig;
use agentstack_core::policy::{ManagedPolicyRef, PermissionStatement};
use agentstack_core::provider::attributes;
use agentstack_core::resource::{
    Identity, LifecycleRule, Principal, RemovalPolicy, Repository, Resource,
};
use agentstack_core::{Environment, Output, PolicyAssembler, Result, Stack, ValueRef};
use tracing::debug;

use crate::ROLE_ARN_EXPORT;

pub const REPOSITORY_ID: &str = "AgentRepository";
pub const ROLE_ID: &str = "AgentRuntimeRole";
pub const ROLE_DESCRIPTION: &str = "Execution role for AgentCore runtime";
pub const AGENTCORE_SERVICE: &str = "bedrock-agentcore";
pub const OBSERVABILITY_POLICY: &str = "CloudWatchFullAccess";

/// Inputs for the foundation stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundationProps {
    pub stack_name: String,
    pub description: Option<String>,
    pub repository_name: String,
    pub max_image_count: u32,
    pub removal_policy: RemovalPolicy,
}

impl FoundationProps {
    pub fn new(repository_name: impl Into<String>) -> Self {
        Self {
            repository_name: repository_name.into(),
            ..Self::from(&FoundationConfig::default())
        }
    }
}

impl From<&FoundationConfig> for FoundationProps {
    fn from(config: &FoundationConfig) -> Self {
        Self {
            stack_name: config.stack_name.clone(),
            description: config.description.clone(),
            repository_name: config.repository_name.clone(),
            max_image_count: config.max_image_count,
            removal_policy: config.removal_policy,
        }
    }
}

/// Pull access to every repository in the account/region.
pub fn ecr_image_access(env: &Environment) -> PermissionStatement {
    PermissionStatement::allow()
        .with_sid("ECRImageAccess")
        .with_actions(["ecr:BatchGetImage", "ecr:GetDownloadUrlForLayer"])
        .with_resources([env.arn("ecr", "repository/*").to_string()])
}

/// Trace submission. The tracing APIs cannot be scoped to resources.
pub fn xray_tracing() -> PermissionStatement {
    PermissionStatement::allow()
        .with_actions([
            "xray:PutTraceSegments",
            "xray:PutTelemetryRecords",
            "xray:GetSamplingRules",
            "xray:GetSamplingTargets",
        ])
        .with_resources(["*"])
}

/// Model invocation through InvokeModel and Converse, on foundation models
/// in any region and on inference profiles (regional, cross-region and the
/// account-wide catch-all).
pub fn model_invocation(env: &Environment) -> PermissionStatement {
    let partition = &env.partition;
    let account = &env.account;
    PermissionStatement::allow()
        .with_sid("BedrockModelInvocation")
        .with_actions([
            "bedrock:InvokeModel",
            "bedrock:InvokeModelWithResponseStream",
            "bedrock:Converse",
            "bedrock:ConverseStream",
        ])
        .with_resources([
            format!("arn:{}:bedrock:*::foundation-model/*", partition),
            env.arn("bedrock", "inference-profile/*").to_string(),
            format!("arn:{}:bedrock:*:{}:inference-profile/*", partition, account),
            env.arn("bedrock", "*").to_string(),
        ])
}

/// Full access to the logging service.
pub fn observability_policy() -> ManagedPolicyRef {
    ManagedPolicyRef::aws_managed(OBSERVABILITY_POLICY)
}

/// Execution role assumed by the agent runtime service, with its grant set
/// attached in audit order: image pull, logging, tracing, model invocation.
pub fn execution_role(env: &Environment) -> Result<Identity> {
    let role = Identity::builder(ROLE_ID)
        .assumed_by(Principal::service(env.service_principal(AGENTCORE_SERVICE)))
        .description(ROLE_DESCRIPTION)
        .build();

    let mut assembler = PolicyAssembler::new(role);
    assembler.attach(ecr_image_access(env))?;
    assembler.attach_managed(observability_policy());
    assembler.attach(xray_tracing())?;
    assembler.attach(model_invocation(env))?;

    Ok(assembler.finish())
}

/// Define the foundation stack: one repository, one execution role, and two
/// outputs (repository URI, and role ARN exported for the runtime stack).
pub fn foundation_stack(env: &Environment, props: &FoundationProps) -> Result<Stack> {
    let repository = Repository::builder(REPOSITORY_ID, &props.repository_name)
        .lifecycle_rule(LifecycleRule::keep_last(props.max_image_count))
        .removal_policy(props.removal_policy)
        .build()?;
    let role = execution_role(env)?;

    let mut stack = Stack::new(&props.stack_name, env.clone());
    if let Some(description) = &props.description {
        stack = stack.with_description(description);
    }

    stack.add_resource(Resource::Repository(repository))?;
    stack.add_resource(Resource::Identity(role))?;

    stack.add_output(
        Output::new(
            "RepositoryUri",
            ValueRef::attribute(REPOSITORY_ID, attributes::REPOSITORY_URI),
        )
        .description("ECR Repository URI for agent container"),
    )?;
    stack.add_output(
        Output::new("RoleArn", ValueRef::attribute(ROLE_ID, attributes::ARN))
            .description("IAM Role ARN for AgentCore Runtime")
            .export(ROLE_ARN_EXPORT),
    )?;

    debug!(stack = %stack.name, repository = %props.repository_name, "Defined foundation stack");
    Ok(stack)
}
