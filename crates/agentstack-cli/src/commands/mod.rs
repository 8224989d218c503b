//! CLI command implementations.

pub mod deploy;
pub mod state;

use agentstack_config::{VariableContext, parse_app_config_with};
use agentstack_core::{Environment, Stack};
use agentstack_stacks::app_stacks;
use anyhow::{Context, Result};
use std::path::Path;

/// Parse the app config at `path` and build its stacks. Artifact paths are
/// relative to the config file's directory.
pub fn load_app(path: &Path) -> Result<(Environment, Vec<Stack>)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let vars = VariableContext::from_process_env();
    let config = parse_app_config_with(&content, vars.clone())
        .with_context(|| format!("Failed to parse app config: {}", path.display()))?;

    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let stacks = app_stacks(&config, &vars, base_dir)
        .with_context(|| format!("Invalid app definition: {}", path.display()))?;
    Ok(stacks)
}

pub fn validate(path: &Path) -> Result<()> {
    let (env, stacks) = load_app(path)?;
    println!("Configuration is valid");
    println!("  account: {}  region: {}", env.account, env.region);
    for stack in &stacks {
        println!(
            "  {} ({} resources, exports: {:?}, imports: {:?})",
            stack.name,
            stack.resources.len(),
            stack.exports(),
            stack.imports()
        );
    }
    Ok(())
}

pub fn synth(path: &Path, only: Option<&str>) -> Result<()> {
    let (_, stacks) = load_app(path)?;

    let mut templates = serde_json::Map::new();
    for stack in stacks.iter().filter(|s| only.is_none_or(|name| s.name == name)) {
        templates.insert(stack.name.clone(), stack.template());
    }
    if templates.is_empty() {
        if let Some(name) = only {
            anyhow::bail!("No stack named '{}'", name);
        }
    }

    println!("{}", serde_json::to_string_pretty(&templates)?);
    Ok(())
}
