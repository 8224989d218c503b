//! Deploy, plan, outputs and destroy against the simulated provider.

use agentstack_core::CrossStackChannel;
use agentstack_deployer::SimulatedProvider;
use agentstack_orchestrator::{DeploymentEvent, Orchestrator, StackState};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::load_app;
use super::state::StateFile;

fn orchestrator(state: StateFile) -> Orchestrator {
    let channel = Arc::new(CrossStackChannel::from_snapshot(state.exports));
    Orchestrator::new(Arc::new(SimulatedProvider::new()), channel).with_state(state.deployed)
}

async fn persist(orchestrator: &Orchestrator, state_dir: &Path) -> Result<()> {
    let state = StateFile {
        deployed: orchestrator.state().await,
        exports: orchestrator
            .channel()
            .snapshot()
            .context("Failed to snapshot exports")?,
    };
    state.save(state_dir)
}

pub async fn plan(config_path: &Path, state_dir: &Path) -> Result<()> {
    let (_, stacks) = load_app(config_path)?;
    let orchestrator = orchestrator(StateFile::load(state_dir)?);

    for stack in &stacks {
        let plan = orchestrator.plan(stack).await?;
        println!("{}", plan);
        for change in plan.to_add.iter().chain(&plan.to_change).chain(&plan.to_destroy) {
            println!("  {} {} ({})", change.action, change.logical_id, change.kind);
        }
    }
    Ok(())
}

pub async fn deploy(config_path: &Path, state_dir: &Path, only: Option<&str>) -> Result<()> {
    let (env, stacks) = load_app(config_path)?;
    let stacks: Vec<_> = stacks
        .into_iter()
        .filter(|s| only.is_none_or(|name| s.name == name))
        .collect();
    if stacks.is_empty() {
        anyhow::bail!("No stack named '{}'", only.unwrap_or_default());
    }

    let (tx, mut rx) = mpsc::channel(100);
    let orchestrator = orchestrator(StateFile::load(state_dir)?).with_events(tx);
    println!(
        "Deploying to {} / {} via {} provider",
        env.account,
        env.region,
        orchestrator.provider_name()
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                DeploymentEvent::StackStarted {
                    stack,
                    deployment_id,
                } => {
                    println!("▶ Stack '{}' started ({})", stack, deployment_id);
                }
                DeploymentEvent::ResourceApplied {
                    stack,
                    logical_id,
                    action,
                } => {
                    println!("  [{}] {} {}", stack, action, logical_id);
                }
                DeploymentEvent::StackCompleted { stack, success } => {
                    if success {
                        println!("✓ Stack '{}' deployed\n", stack);
                    } else {
                        println!("✗ Stack '{}' failed\n", stack);
                    }
                }
                DeploymentEvent::StackRolledBack { stack, reason } => {
                    println!("↺ Stack '{}' rolled back: {}", stack, reason);
                }
                DeploymentEvent::StackSkipped { stack, reason } => {
                    println!("⊘ Stack '{}' skipped: {}", stack, reason);
                }
            }
        }
    });

    let result = orchestrator.deploy(&stacks).await;
    persist(&orchestrator, state_dir).await?;
    drop(orchestrator);
    printer.await.context("Event printer task failed")?;
    let result = result?;

    println!("--- Stack Summary ---");
    for name in &result.order {
        let status = match &result.stack_states[name] {
            StackState::Deployed => "✓ deployed".to_string(),
            StackState::Failed { message } => format!("✗ failed: {}", message),
            StackState::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StackState::Pending => "○ pending".to_string(),
        };
        println!("  {} - {}", name, status);
    }
    for report in &result.reports {
        println!("\n{}", report.changes);
        for output in &report.outputs {
            println!("  {} = {}", output.key, output.value);
        }
    }

    if result.success {
        Ok(())
    } else {
        anyhow::bail!("Deployment failed");
    }
}

pub fn outputs(state_dir: &Path, only: Option<&str>) -> Result<()> {
    let state = StateFile::load(state_dir)?;
    if state.deployed.stacks.is_empty() {
        println!("No stacks deployed");
        return Ok(());
    }

    for stack in state
        .deployed
        .stacks
        .values()
        .filter(|s| only.is_none_or(|name| s.name == name))
    {
        println!("{} ({})", stack.name, stack.deployment_id);
        for output in &stack.outputs {
            match &output.export_name {
                Some(export) => println!("  {} = {}  [export: {}]", output.key, output.value, export),
                None => println!("  {} = {}", output.key, output.value),
            }
            if !output.description.is_empty() {
                println!("      {}", output.description);
            }
        }
    }
    Ok(())
}

pub async fn destroy(state_dir: &Path, stack: &str) -> Result<()> {
    let orchestrator = orchestrator(StateFile::load(state_dir)?);
    let result = orchestrator.destroy(stack).await;
    persist(&orchestrator, state_dir).await?;
    result.with_context(|| format!("Failed to destroy stack '{}'", stack))?;
    println!("✓ Stack '{}' destroyed", stack);
    Ok(())
}
