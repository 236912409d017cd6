//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: Receive and execute a task immediately
//! - recover: Find (and optionally execute) interrupted tasks
//! - status: Show state store counters and learned confidence
//! - specialists: List specialists with their performance
//! - history: Show last N tasks
//! - audit: Show recent audit entries
//! - checkpoints: Show the checkpoints of one task
//! - cancel: Cancel a task that has not run yet

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;

use crate::conductor::analyzer::STRATEGY_OVERRIDE_KEY;
use crate::conductor::types::short_id;
use crate::conductor::{
    ExecutionOutcome, LocalSpecialistChannel, Orchestrator, OrchestratorContext,
    SimulatedSpecialist, TaskPriority,
};
use crate::config::Config;
use crate::db::StateManager;
use sdk::{Collaborators, OrchestratorErrorExt};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Open the state store named in the configuration
async fn open_state(config: &Config) -> Result<StateManager> {
    let db_path = config.database_path();
    StateManager::open(&db_path)
        .await
        .with_context(|| format!("Failed to open state store at {}", db_path.display()))
}

/// Build and start an orchestrator for the configured room
///
/// Without a remote transport every specialist is answered by the local
/// simulated handler.
async fn start_orchestrator(config: &Config, state: StateManager) -> Result<Orchestrator> {
    let channel = LocalSpecialistChannel::with_fallback(Arc::new(SimulatedSpecialist::new()));
    let ctx = OrchestratorContext::build(config, state, Arc::new(channel), Collaborators::new())
        .context("Failed to build orchestrator context")?;

    let orchestrator = Orchestrator::new(ctx);
    orchestrator
        .start()
        .await
        .context("Failed to start orchestrator")?;
    Ok(orchestrator)
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn print_outcome(outcome: &ExecutionOutcome) {
    println!("Task ID: {}", outcome.task_id);
    println!("  Outcome: {}", outcome.outcome);
    println!("  Confidence: {:.2}", outcome.confidence);
    println!("  Duration: {}ms", outcome.duration_ms);
    if !outcome.specialists_used.is_empty() {
        println!("  Specialists: {}", outcome.specialists_used.join(", "));
    }
    if let Some(result) = &outcome.result {
        println!("  Result: {}", result);
    }
    if let Some(error) = &outcome.error {
        println!("  Error: {}", error);
    }
}

/// Receive a task and execute it right away
pub async fn handle_run(
    prompt: String,
    task_id: Option<String>,
    context_id: String,
    priority: String,
    strategy: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let priority: TaskPriority = priority.parse()?;
    let mut metadata = json!({ "source": "cli" });
    if let Some(strategy) = strategy {
        metadata[STRATEGY_OVERRIDE_KEY] = json!(strategy);
    }

    let state = open_state(config).await?;
    let orchestrator = start_orchestrator(config, state).await?;

    let task_id = task_id.unwrap_or_else(|| short_id("task", 12));
    let receipt = match orchestrator
        .receive_task(&task_id, &context_id, &prompt, priority, metadata)
        .await
    {
        Ok(receipt) => receipt,
        Err(e) => {
            let hint = e.user_hint().to_string();
            orchestrator.stop().await.ok();
            return Err(anyhow::Error::new(e).context(hint));
        }
    };

    let outcome = orchestrator.execute_task(&receipt.task_id).await;
    orchestrator
        .stop()
        .await
        .context("Failed to stop orchestrator")?;

    match format {
        OutputFormat::Text => print_outcome(&outcome),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}

/// Recover tasks interrupted by a previous process
pub async fn handle_recover(execute: bool, config: &Config, format: OutputFormat) -> Result<()> {
    let state = open_state(config).await?;
    let orchestrator = start_orchestrator(config, state).await?;

    let recovered = orchestrator
        .recover()
        .await
        .context("Failed to recover tasks")?;

    let mut outcomes = Vec::new();
    if execute {
        for task_id in &recovered {
            outcomes.push(orchestrator.execute_task(task_id).await);
        }
    }
    orchestrator
        .stop()
        .await
        .context("Failed to stop orchestrator")?;

    match format {
        OutputFormat::Text => {
            if recovered.is_empty() {
                println!("No interrupted tasks");
                return Ok(());
            }
            println!("Recovered {} task(s):", recovered.len());
            for task_id in &recovered {
                println!("  {}", task_id);
            }
            if execute {
                println!();
                for outcome in &outcomes {
                    print_outcome(outcome);
                    println!();
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "recovered": recovered,
                "executed": execute,
                "outcomes": outcomes,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Show state store counters and the confidence learned for this room
pub async fn handle_status(config: &Config, format: OutputFormat) -> Result<()> {
    let state = open_state(config).await?;
    let owner_id = config.orchestrator.orchestrator_id();

    let stats = state.stats().await.context("Failed to read statistics")?;
    let confidences = state
        .load_confidences(&owner_id)
        .await
        .context("Failed to load learned confidence")?;
    let active = state
        .get_active_tasks(Some(&owner_id))
        .await
        .context("Failed to list active tasks")?;

    match format {
        OutputFormat::Text => {
            println!("Kommandant Status ({})", owner_id);
            println!("  Database: {}", config.database_path().display());
            println!("  Total tasks: {}", stats.total_tasks);
            for (status, count) in &stats.tasks_by_status {
                println!("    {}: {}", status, count);
            }
            println!("  Active tasks: {}", active.len());
            println!("  Checkpoints: {}", stats.checkpoints);
            println!("  Specialists tracked: {}", stats.specialists_tracked);
            println!("  Experiences: {}", stats.experiences);
            println!("  Audit entries: {}", stats.audit_entries);

            if !confidences.is_empty() {
                println!();
                println!("Learned confidence:");
                let mut sorted: Vec<_> = confidences.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                for (signature, value) in sorted {
                    println!("  {:<40} {:.2}", signature, value);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "orchestrator_id": owner_id,
                "stats": stats,
                "active_tasks": active.len(),
                "confidences": confidences,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    state.close().await.ok();
    Ok(())
}

/// List registered specialists with performance restored from the store
pub async fn handle_specialists(config: &Config, format: OutputFormat) -> Result<()> {
    let state = open_state(config).await?;
    let orchestrator = start_orchestrator(config, state).await?;

    let mut specialists = orchestrator.context().registry.list();
    specialists.sort_by(|a, b| a.id.cmp(&b.id));
    orchestrator
        .stop()
        .await
        .context("Failed to stop orchestrator")?;

    match format {
        OutputFormat::Text => {
            if specialists.is_empty() {
                println!("No specialists registered");
                return Ok(());
            }
            println!("Specialists ({}):", specialists.len());
            println!();
            for info in &specialists {
                println!("{} [{}]", info.id, info.kind);
                println!(
                    "  Capabilities: {}",
                    info.capabilities
                        .iter()
                        .map(|c| c.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                println!("  Availability: {}", info.availability.as_str());
                println!("  Load: {}/{}", info.current_load, info.max_load);
                println!("  Performance: {:.2}", info.performance_score);
                println!(
                    "  Tasks: {} ok, {} failed",
                    info.success_count, info.failure_count
                );
                if let Some(last) = info.last_task_at {
                    println!("  Last task: {}", format_millis(last));
                }
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "specialists": specialists,
                "count": specialists.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Show last N tasks
pub async fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let state = open_state(config).await?;
    let tasks = state
        .get_recent_tasks(limit as i64)
        .await
        .context("Failed to fetch task history")?;

    match format {
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No tasks in history");
                return Ok(());
            }

            println!("Task History (last {} tasks):", limit);
            println!();

            for task in &tasks {
                println!("Task ID: {}", task.task_id);
                println!("  Prompt: {}", task.prompt);
                println!("  Status: {}", task.status.as_str());
                println!("  Owner: {}", task.owner_id);
                if let Some(started) = task.started_at {
                    println!("  Started: {}", format_millis(started));
                }
                if let Some(completed) = task.completed_at {
                    println!("  Completed: {}", format_millis(completed));
                }
                if !task.errors.is_empty() {
                    println!("  Errors: {}", task.errors.join("; "));
                }
                println!();
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "tasks": tasks,
                "count": tasks.len(),
                "limit": limit
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    state.close().await.ok();
    Ok(())
}

/// Show recent audit entries, newest first
pub async fn handle_audit(
    limit: usize,
    actor: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let state = open_state(config).await?;
    let entries = state
        .recent_audit(actor.as_deref(), limit as i64)
        .await
        .context("Failed to read audit log")?;

    match format {
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No audit entries");
                return Ok(());
            }
            for entry in &entries {
                println!(
                    "{} [{}] {} {} -> {} ({})",
                    format_millis(entry.timestamp),
                    entry.severity.as_str(),
                    entry.actor,
                    entry.action,
                    entry.target,
                    entry.outcome
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "entries": entries,
                "count": entries.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    state.close().await.ok();
    Ok(())
}

/// Show the checkpoints recorded for one task, newest first
pub async fn handle_checkpoints(
    task_id: String,
    limit: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let state = open_state(config).await?;
    let task = state
        .get_task_state(&task_id)
        .await
        .context("Failed to fetch task")?
        .ok_or_else(|| anyhow::anyhow!("Task not found: {}", task_id))?;
    let checkpoints = state
        .get_checkpoints(&task_id, limit as i64)
        .await
        .context("Failed to fetch checkpoints")?;

    match format {
        OutputFormat::Text => {
            println!("Checkpoints for {} ({}):", task_id, task.status.as_str());
            println!();
            for checkpoint in &checkpoints {
                println!(
                    "{} {:<20} {}",
                    format_millis(checkpoint.created_at),
                    checkpoint.checkpoint_type.as_str(),
                    checkpoint.message
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "task": task,
                "checkpoints": checkpoints,
                "count": checkpoints.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    state.close().await.ok();
    Ok(())
}

/// Cancel a pending task
pub async fn handle_cancel(task_id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let state = open_state(config).await?;
    let orchestrator = start_orchestrator(config, state).await?;

    let result = orchestrator.cancel_task(&task_id).await;
    orchestrator
        .stop()
        .await
        .context("Failed to stop orchestrator")?;
    let cancelled = match result {
        Ok(cancelled) => cancelled,
        Err(e) => {
            let hint = e.user_hint().to_string();
            return Err(anyhow::Error::new(e).context(hint));
        }
    };

    match format {
        OutputFormat::Text => {
            if cancelled {
                println!("Task {} cancelled", task_id);
            } else {
                println!("Task {} had already finished", task_id);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "task_id": task_id,
                "cancelled": cancelled,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
