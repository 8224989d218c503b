//! Runtime stack: binds the imported execution role and a build artifact
//! into one agent runtime.

use agentstack_config::RuntimeConfig;
use agentstack_core::artifact::Artifact;
use agentstack_core::provider::attributes;
use agentstack_core::resource::{Resource, Runtime};
use agentstack_core::{CrossStackChannel, Environment, Error, Output, Result, Stack, ValueRef};
use tracing::{debug, info};

use crate::{ENDPOINT_NAME_EXPORT, ROLE_ARN_EXPORT, RUNTIME_ARN_EXPORT};

pub const RUNTIME_ID: &str = "AgentRuntime";
/// Endpoint the runtime service creates alongside every runtime.
pub const DEFAULT_ENDPOINT: &str = "DEFAULT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeProps {
    pub stack_name: String,
    pub description: Option<String>,
    pub agent_name: String,
    pub artifact: Artifact,
    /// Export holding the execution role ARN.
    pub role_export: String,
}

impl RuntimeProps {
    pub fn new(
        stack_name: impl Into<String>,
        agent_name: impl Into<String>,
        artifact: Artifact,
    ) -> Self {
        Self {
            stack_name: stack_name.into(),
            description: None,
            agent_name: agent_name.into(),
            artifact,
            role_export: ROLE_ARN_EXPORT.to_string(),
        }
    }

    pub fn from_config(config: &RuntimeConfig, artifact: Artifact) -> Self {
        Self {
            stack_name: config.stack_name.clone(),
            description: config.description.clone(),
            agent_name: config.agent_name.clone(),
            artifact,
            role_export: config
                .role_export
                .clone()
                .unwrap_or_else(|| ROLE_ARN_EXPORT.to_string()),
        }
    }
}

/// Builds the runtime stack and, at deploy time, the bound runtime resource.
#[derive(Debug, Clone)]
pub struct RuntimeBinder {
    props: RuntimeProps,
}

impl RuntimeBinder {
    pub fn new(props: RuntimeProps) -> Self {
        Self { props }
    }

    pub fn props(&self) -> &RuntimeProps {
        &self.props
    }

    fn runtime(&self) -> Result<Runtime> {
        Runtime::new(
            RUNTIME_ID,
            &self.props.agent_name,
            ValueRef::import(&self.props.role_export),
            self.props.artifact.clone(),
        )
    }

    /// Stack definition with the role recorded as an import intent.
    ///
    /// Nothing is looked up here; the orchestrator resolves the import once
    /// the producing stack is deployed.
    pub fn define(&self, env: &Environment) -> Result<Stack> {
        let mut stack = Stack::new(&self.props.stack_name, env.clone());
        if let Some(description) = &self.props.description {
            stack = stack.with_description(description);
        }

        stack.add_resource(Resource::Runtime(self.runtime()?))?;

        stack.add_output(
            Output::new(
                "AgentRuntimeArn",
                ValueRef::attribute(RUNTIME_ID, attributes::AGENT_RUNTIME_ARN),
            )
            .description("AgentCore Runtime ARN")
            .export(RUNTIME_ARN_EXPORT),
        )?;
        stack.add_output(
            Output::new("AgentEndpointName", ValueRef::literal(DEFAULT_ENDPOINT))
                .description("AgentRuntime Endpoint Name (DEFAULT auto-created)")
                .export(ENDPOINT_NAME_EXPORT),
        )?;

        debug!(stack = %stack.name, agent = %self.props.agent_name, "Defined runtime stack");
        Ok(stack)
    }

    /// Construct the runtime with its role resolved through `channel`.
    ///
    /// Fails with `UnresolvedImport` when the role export has not been
    /// published; no runtime is returned in that case.
    pub fn bind(&self, env: &Environment, channel: &CrossStackChannel) -> Result<Runtime> {
        let bound = Resource::Runtime(self.runtime()?).bind_imports(channel, &self.props.stack_name)?;
        let Resource::Runtime(runtime) = bound else {
            return Err(Error::Internal("binding changed the resource kind".to_string()));
        };

        info!(
            stack = %self.props.stack_name,
            runtime = %runtime.name,
            account = %env.account,
            region = %env.region,
            "Bound runtime to execution role"
        );
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/AgentCoreInfra-AgentRuntimeRole-1A2B3C";

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1").unwrap()
    }

    fn binder() -> RuntimeBinder {
        RuntimeBinder::new(RuntimeProps::new(
            "AgentCoreRuntime",
            "MyAgent",
            Artifact::from_image("123456789012.dkr.ecr.us-east-1.amazonaws.com/agent:latest"),
        ))
    }

    #[test]
    fn test_define_records_import_intent() {
        let stack = binder().define(&env()).unwrap();

        assert_eq!(stack.resources.len(), 1);
        assert!(stack.imports().contains(ROLE_ARN_EXPORT));
        assert_eq!(stack.exports(), vec![RUNTIME_ARN_EXPORT, ENDPOINT_NAME_EXPORT]);

        match stack.resource(RUNTIME_ID) {
            Some(Resource::Runtime(runtime)) => {
                assert_eq!(runtime.name, "MyAgent");
                assert_eq!(runtime.execution_role, ValueRef::import(ROLE_ARN_EXPORT));
            }
            other => panic!("expected runtime, got {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_output_is_default() {
        let stack = binder().define(&env()).unwrap();
        let endpoint = stack
            .outputs
            .iter()
            .find(|o| o.key == "AgentEndpointName")
            .unwrap();
        assert_eq!(endpoint.value, ValueRef::literal("DEFAULT"));
        assert_eq!(endpoint.export_name.as_deref(), Some(ENDPOINT_NAME_EXPORT));
    }

    #[test]
    fn test_bind_unresolved_import() {
        let channel = CrossStackChannel::new();
        let err = binder().bind(&env(), &channel).unwrap_err();
        assert!(matches!(
            err,
            Error::UnresolvedImport { ref export, stack: Some(ref s) }
                if export == ROLE_ARN_EXPORT && s == "AgentCoreRuntime"
        ));
    }

    #[test]
    fn test_bind_resolved_import() {
        let channel = CrossStackChannel::new();
        channel.publish("AgentCoreInfra", ROLE_ARN_EXPORT, ROLE_ARN).unwrap();
        channel.commit("AgentCoreInfra").unwrap();

        let runtime = binder().bind(&env(), &channel).unwrap();
        assert_eq!(runtime.logical_id, RUNTIME_ID);
        assert_eq!(runtime.execution_role, ValueRef::literal(ROLE_ARN));
        // Binding only reads the channel.
        assert!(channel.importers_of(ROLE_ARN_EXPORT).unwrap().is_empty());
    }

    #[test]
    fn test_custom_role_export() {
        let config = RuntimeConfig {
            role_export: Some("SharedAgentRoleArn".to_string()),
            ..RuntimeConfig::default()
        };
        let props = RuntimeProps::from_config(&config, Artifact::from_image("agent:latest"));
        let stack = RuntimeBinder::new(props).define(&env()).unwrap();
        assert!(stack.imports().contains("SharedAgentRoleArn"));
        assert!(!stack.imports().contains(ROLE_ARN_EXPORT));
    }

    #[test]
    fn test_invalid_agent_name() {
        let props = RuntimeProps::new("AgentCoreRuntime", "my-agent", Artifact::from_image("a:1"));
        let result = RuntimeBinder::new(props).define(&env());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
