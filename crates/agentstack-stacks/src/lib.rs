//! Stack definitions for the two-stack agent deployment.
//!
//! - [`foundation`]: container repository plus execution role, exporting the role ARN
//! - [`runtime`]: agent runtime bound to the imported role and a build artifact
//!
//! Export names are a contract between stacks. Renaming one is a breaking
//! change for every importer.

pub mod error;
pub mod foundation;
pub mod runtime;

use agentstack_config::{AppConfig, ArtifactLocation, VariableContext};
use agentstack_core::artifact::Artifact;
use agentstack_core::{Environment, Stack};
use std::path::Path;
use tracing::debug;

pub use error::{StackError, StackResult};
pub use foundation::{FoundationProps, foundation_stack};
pub use runtime::{RuntimeBinder, RuntimeProps};

/// Export carrying the execution role ARN.
pub const ROLE_ARN_EXPORT: &str = "AgentCoreRuntimeRoleArn";
/// Export carrying the agent runtime ARN.
pub const RUNTIME_ARN_EXPORT: &str = "AgentCoreRuntimeArn";
/// Export carrying the runtime endpoint name.
pub const ENDPOINT_NAME_EXPORT: &str = "AgentCoreEndpointName";

/// Build every stack an app config declares, producers first.
///
/// Relative artifact paths are resolved against `base_dir` and must exist.
pub fn app_stacks(
    config: &AppConfig,
    vars: &VariableContext,
    base_dir: &Path,
) -> StackResult<(Environment, Vec<Stack>)> {
    let env = config.environment(vars)?;

    let foundation = foundation_stack(&env, &FoundationProps::from(&config.foundation))?;
    let mut stacks = vec![foundation];

    if let Some(runtime) = &config.runtime {
        let artifact = match &runtime.artifact {
            ArtifactLocation::Asset(path) => Artifact::from_asset(base_dir.join(path))?,
            ArtifactLocation::Image(uri) => Artifact::from_image(uri.clone()),
        };
        debug!(
            stack = %runtime.stack_name,
            artifact = %artifact.location(),
            "Bound runtime artifact"
        );
        let binder = RuntimeBinder::new(RuntimeProps::from_config(runtime, artifact));
        stacks.push(binder.define(&env)?);
    }

    Ok((env, stacks))
}
