//! Kommandant orchestrator
//!
//! Facade over the conductor components for one room. Receives tasks, drives
//! them through analysis, planning, delegation and learning, and keeps the
//! state store and audit log in step with what happened.
//!
//! Execution is serialized per instance. `execute_task` never returns an
//! error: every fault is caught at this boundary, audited, persisted on the
//! task and turned into a failed `ExecutionOutcome`.

use sdk::{EngineError, OrchestratorErrorExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::db::{now_millis, CheckpointType};
use crate::message_bus::Event;

use super::audit::{AuditEntry, AuditSeverity};
use super::context::OrchestratorContext;
use super::types::{
    ExecutionOutcome, Experience, OrchestratorStatus, Task, TaskOutcome, TaskPriority,
    TaskReceipt, TaskStatus,
};

/// Counters reported by `statistics`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorStatistics {
    pub orchestrator_id: String,
    pub status: OrchestratorStatus,
    pub tasks_received: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub active_tasks: usize,
    pub delegations_total: u64,
    pub delegations_successful: u64,
    pub success_rate: f64,
    pub specialists: usize,
    pub experiences: usize,
    pub confidences: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct Counters {
    tasks_received: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    delegations_total: u64,
    delegations_successful: u64,
}

fn db_error(e: anyhow::Error) -> EngineError {
    EngineError::Database(format!("{:#}", e))
}

/// Removes a task id from the running set on every exit path
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    task_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

pub struct Orchestrator {
    ctx: OrchestratorContext,
    status: Mutex<OrchestratorStatus>,
    tasks: Mutex<HashMap<String, Task>>,
    running: Mutex<HashSet<String>>,
    execution: tokio::sync::Mutex<()>,
    counters: Mutex<Counters>,
}

impl Orchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        Self {
            ctx,
            status: Mutex::new(OrchestratorStatus::Initializing),
            tasks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            execution: tokio::sync::Mutex::new(()),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn orchestrator_id(&self) -> &str {
        &self.ctx.orchestrator_id
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    pub fn status(&self) -> OrchestratorStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: OrchestratorStatus) -> Result<(), EngineError> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if !status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: status.to_string(),
                to: next.to_string(),
            });
        }
        debug!("{}: {} -> {}", self.ctx.orchestrator_id, *status, next);
        *status = next;
        Ok(())
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn audit(
        &self,
        action: &str,
        target: &str,
        details: Value,
        outcome: &str,
        severity: AuditSeverity,
    ) -> AuditEntry {
        self.ctx.audit.record(
            action,
            &self.ctx.orchestrator_id,
            target,
            details,
            outcome,
            severity,
        )
    }

    /// Connect to collaborators, restore learned state and become idle
    ///
    /// Collaborator failures are logged and audited but never fatal. Calling
    /// `start` on a running orchestrator does nothing.
    pub async fn start(&self) -> Result<(), EngineError> {
        match self.status() {
            OrchestratorStatus::Initializing => {}
            OrchestratorStatus::Stopped => {
                return Err(EngineError::InvalidTransition {
                    from: OrchestratorStatus::Stopped.to_string(),
                    to: OrchestratorStatus::Idle.to_string(),
                })
            }
            _ => {
                debug!("{} already running", self.ctx.orchestrator_id);
                return Ok(());
            }
        }

        info!("Starting {}", self.ctx.orchestrator_id);
        let collaborators = self.ctx.collaborators.clone();

        if let Some(event_bus) = &collaborators.event_bus {
            if let Err(e) = event_bus.connect(&self.ctx.orchestrator_id).await {
                self.collaborator_failed("event_bus_connect", &self.ctx.orchestrator_id, &e);
            }
        }

        if let Some(registry) = &collaborators.task_registry {
            if let Err(e) = registry
                .register_orchestrator(&self.ctx.orchestrator_id, &self.ctx.settings.name)
                .await
            {
                self.collaborator_failed(
                    "task_registry_register",
                    &self.ctx.orchestrator_id,
                    &e,
                );
            }
        }

        if let Some(discovery) = &collaborators.discovery {
            match discovery.discover().await {
                Ok(descriptors) => {
                    let mut registered = 0;
                    for descriptor in &descriptors {
                        match self.ctx.registry.register_descriptor(descriptor) {
                            Ok(()) => registered += 1,
                            Err(e) => warn!("Ignoring discovered specialist: {}", e),
                        }
                    }
                    info!("Discovered {} specialist(s)", registered);
                }
                Err(e) => {
                    self.collaborator_failed("specialist_discovery", &self.ctx.orchestrator_id, &e)
                }
            }
        }

        match self.ctx.learning.restore().await {
            Ok(count) if count > 0 => info!("Restored {} learned confidence value(s)", count),
            Ok(_) => {}
            Err(e) => warn!("Could not restore learned confidence: {:#}", e),
        }
        match self.ctx.state.list_specialist_metrics().await {
            Ok(stored) => {
                let applied = self.ctx.registry.restore_metrics(&stored);
                if applied > 0 {
                    info!("Restored metrics for {} specialist(s)", applied);
                }
            }
            Err(e) => warn!("Could not restore specialist metrics: {:#}", e),
        }

        self.transition(OrchestratorStatus::Idle)?;
        self.report_orchestrator_status("idle").await;
        self.audit(
            "orchestrator_started",
            &self.ctx.orchestrator_id,
            json!({
                "room_id": self.ctx.room_id,
                "specialists": self.ctx.registry.len(),
            }),
            "success",
            AuditSeverity::Info,
        );
        self.ctx
            .bus
            .publish(Event::OrchestratorStarted {
                orchestrator_id: self.ctx.orchestrator_id.clone(),
            })
            .await;
        info!("{} is idle", self.ctx.orchestrator_id);
        Ok(())
    }

    fn collaborator_failed(&self, action: &str, target: &str, error: &EngineError) {
        warn!("{} for {} failed: {}", action, target, error);
        self.audit(
            action,
            target,
            json!({ "error": error.to_string() }),
            "failure",
            AuditSeverity::Warning,
        );
    }

    /// Accept a task without executing it
    ///
    /// Receiving an id that is still pending or running returns the original
    /// receipt.
    pub async fn receive_task(
        &self,
        task_id: &str,
        context_id: &str,
        prompt: &str,
        priority: TaskPriority,
        metadata: Value,
    ) -> Result<TaskReceipt, EngineError> {
        match self.status() {
            OrchestratorStatus::Initializing => {
                return Err(EngineError::Validation(
                    "orchestrator has not been started".to_string(),
                ))
            }
            OrchestratorStatus::Stopped => {
                return Err(EngineError::Validation(
                    "orchestrator is stopped".to_string(),
                ))
            }
            _ => {}
        }
        if task_id.trim().is_empty() {
            return Err(EngineError::Validation("task_id must not be empty".to_string()));
        }
        if context_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "context_id must not be empty".to_string(),
            ));
        }
        if prompt.trim().is_empty() {
            return Err(EngineError::Validation("prompt must not be empty".to_string()));
        }
        let length = prompt.chars().count();
        if length > self.ctx.settings.max_prompt_length {
            return Err(EngineError::Validation(format!(
                "prompt is {} characters, the limit is {}",
                length, self.ctx.settings.max_prompt_length
            )));
        }

        if let Some(existing) = self.find_task(task_id).await? {
            if !existing.status.is_terminal() {
                debug!("Task {} already received", task_id);
                return Ok(self.receipt(&existing));
            }
        }

        let metadata = if metadata.is_null() { json!({}) } else { metadata };
        let task = Task::new(task_id, context_id, prompt, priority, metadata);
        self.ctx
            .state
            .save_task_state(&task.to_state(&self.ctx.orchestrator_id, Some(self.ctx.room_id)))
            .await
            .map_err(db_error)?;

        if let Some(registry) = &self.ctx.collaborators.task_registry {
            if let Err(e) = registry
                .create_task(task_id, context_id, prompt, &task.metadata)
                .await
            {
                self.collaborator_failed("task_registry_create", task_id, &e);
            }
        }

        self.counters().tasks_received += 1;
        self.audit(
            "task_received",
            task_id,
            json!({
                "context_id": context_id,
                "priority": priority.as_str(),
                "prompt_length": length,
            }),
            "success",
            AuditSeverity::Info,
        );
        self.ctx
            .bus
            .publish(Event::TaskReceived {
                task_id: task_id.to_string(),
                orchestrator_id: self.ctx.orchestrator_id.clone(),
            })
            .await;

        info!("Received task {} ({})", task_id, priority.as_str());
        let receipt = self.receipt(&task);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), task);
        Ok(receipt)
    }

    fn receipt(&self, task: &Task) -> TaskReceipt {
        TaskReceipt {
            task_id: task.task_id.clone(),
            status: "received".to_string(),
            orchestrator_id: self.ctx.orchestrator_id.clone(),
            received_at: task.received_at,
        }
    }

    /// In-memory task, falling back to the store for tasks this room owns
    async fn find_task(&self, task_id: &str) -> Result<Option<Task>, EngineError> {
        if let Some(task) = self.get_task(task_id) {
            return Ok(Some(task));
        }
        let stored = self
            .ctx
            .state
            .get_task_state(task_id)
            .await
            .map_err(db_error)?;
        Ok(stored
            .filter(|s| s.owner_id == self.ctx.orchestrator_id)
            .map(|s| Task::from_state(&s)))
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    fn store_task(&self, task: &Task) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.task_id.clone(), task.clone());
    }

    /// Run a received task to completion
    pub async fn execute_task(&self, task_id: &str) -> ExecutionOutcome {
        {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if !running.insert(task_id.to_string()) {
                let err = EngineError::TaskAlreadyRunning(task_id.to_string());
                warn!("{}", err);
                return ExecutionOutcome::failure(task_id, TaskOutcome::Failure, err.to_string());
            }
        }
        let _running = RunningGuard {
            running: &self.running,
            task_id: task_id.to_string(),
        };
        let _serial = self.execution.lock().await;

        let status = self.status();
        if status != OrchestratorStatus::Idle {
            let err = EngineError::InvalidTransition {
                from: status.to_string(),
                to: OrchestratorStatus::Analyzing.to_string(),
            };
            return self.refuse_execution(task_id, err).await;
        }

        let task = match self.find_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                let err = EngineError::TaskNotFound(task_id.to_string());
                self.audit(
                    "task_execute",
                    task_id,
                    json!({ "error": err.to_string() }),
                    "rejected",
                    AuditSeverity::Warning,
                );
                return ExecutionOutcome::failure(task_id, TaskOutcome::Failure, err.to_string());
            }
            Err(e) => return self.handle_fault(task_id, e, Instant::now()).await,
        };

        let Some(task) = self.claim_task(task) else {
            info!("Task {} was cancelled before execution", task_id);
            self.audit(
                "task_execute",
                task_id,
                json!({}),
                "cancelled",
                AuditSeverity::Info,
            );
            return ExecutionOutcome::failure(
                task_id,
                TaskOutcome::Cancelled,
                "Task was cancelled",
            );
        };

        let started = Instant::now();
        match self.run_task(task, started).await {
            Ok(outcome) => outcome,
            Err(e) => self.handle_fault(task_id, e, started).await,
        }
    }

    async fn run_task(
        &self,
        mut task: Task,
        started: Instant,
    ) -> Result<ExecutionOutcome, EngineError> {
        let task_id = task.task_id.clone();
        let owner = self.ctx.orchestrator_id.clone();

        // Analyzing
        self.transition(OrchestratorStatus::Analyzing)?;
        self.ctx
            .state
            .save_task_state(&task.to_state(&owner, Some(self.ctx.room_id)))
            .await
            .map_err(db_error)?;
        self.checkpoint(
            &task_id,
            CheckpointType::TaskStart,
            json!({ "prompt": task.prompt, "priority": task.priority.value() }),
            "Task started",
        )
        .await;
        self.ctx
            .bus
            .publish(Event::TaskStarted {
                task_id: task_id.clone(),
                prompt: task.prompt.clone(),
            })
            .await;
        self.report_task(&task_id, TaskStatus::Running.as_str(), 0.0)
            .await;

        let analysis = self.ctx.analyzer.analyze(&task, &self.ctx.learning);
        task.required_capabilities = analysis.required_capabilities.clone();
        self.audit(
            "task_analyzed",
            &task_id,
            json!({
                "capabilities": analysis.required_capabilities,
                "strategy": analysis.strategy,
                "complexity": analysis.complexity,
                "confidence": analysis.confidence,
            }),
            "success",
            AuditSeverity::Info,
        );

        // Delegating
        self.transition(OrchestratorStatus::Delegating)?;
        let plan = self
            .ctx
            .planner
            .create_plan(&task_id, &analysis, task.priority);
        self.checkpoint(
            &task_id,
            CheckpointType::SpecialistAssigned,
            json!({
                "plan_id": plan.plan_id,
                "strategy": plan.strategy,
                "steps": plan.steps,
            }),
            &format!("Planned {} step(s)", plan.steps.len()),
        )
        .await;
        self.audit(
            "plan_created",
            &task_id,
            json!({
                "plan_id": plan.plan_id,
                "mode": plan.execution_mode,
                "steps": plan.steps.len(),
            }),
            if plan.is_empty() { "empty" } else { "success" },
            if plan.is_empty() {
                AuditSeverity::Warning
            } else {
                AuditSeverity::Info
            },
        );

        let input = json!({
            "task_id": task_id,
            "context_id": task.context_id,
            "prompt": task.prompt,
            "metadata": task.metadata,
        });
        let handle = self.ctx.engine.dispatch(plan, input);

        // Monitoring
        self.transition(OrchestratorStatus::Monitoring)?;
        let mut progress = handle.progress.clone();
        let wait = handle.wait();
        tokio::pin!(wait);
        let aggregate = loop {
            tokio::select! {
                result = &mut wait => break result?,
                changed = progress.changed() => {
                    if changed.is_err() {
                        break (&mut wait).await?;
                    }
                    let fraction = *progress.borrow_and_update();
                    self.report_task(&task_id, TaskStatus::Running.as_str(), fraction).await;
                }
            }
        };

        {
            let mut counters = self.counters();
            counters.delegations_total += aggregate.delegations.len() as u64;
            counters.delegations_successful += aggregate.results.len() as u64;
        }

        let outcome = aggregate.outcome();
        let confidence = aggregate.mean_confidence();
        let error = aggregate.error_summary();
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        // Learning
        if self.ctx.settings.auto_learn {
            self.transition(OrchestratorStatus::Learning)?;
            let experience = self
                .ctx
                .learning
                .learn(&task_id, &analysis, &aggregate, duration_ms)
                .await;
            debug!(
                "Task {} produced experience {}",
                task_id, experience.experience_id
            );
        }

        let final_status = outcome.final_status();
        task.status = final_status;
        task.completed_at = Some(now_millis());
        task.delegations = aggregate.delegations.clone();
        task.results = aggregate
            .results
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        for failure in &aggregate.failures {
            task.errors
                .push(format!("{}: {}", failure.specialist_id, failure.error));
        }
        if let Some(summary) = &error {
            task.errors.push(summary.clone());
        }
        self.store_task(&task);
        self.ctx
            .state
            .save_task_state(&task.to_state(&owner, Some(self.ctx.room_id)))
            .await
            .map_err(db_error)?;

        let result = if aggregate.results.is_empty() {
            None
        } else {
            Some(aggregate.combined_output())
        };
        self.checkpoint(
            &task_id,
            CheckpointType::TaskComplete,
            json!({
                "outcome": outcome,
                "status": final_status.as_str(),
                "confidence": confidence,
                "duration_ms": duration_ms,
            }),
            &format!("Task finished: {}", outcome),
        )
        .await;

        let success = outcome == TaskOutcome::Success;
        {
            let mut counters = self.counters();
            if success {
                counters.tasks_completed += 1;
            } else {
                counters.tasks_failed += 1;
            }
        }

        if success {
            self.ctx
                .bus
                .publish(Event::TaskCompleted {
                    task_id: task_id.clone(),
                    result: result.clone().unwrap_or(Value::Null),
                })
                .await;
        } else {
            self.ctx
                .bus
                .publish(Event::TaskFailed {
                    task_id: task_id.clone(),
                    error: error.clone().unwrap_or_else(|| outcome.to_string()),
                })
                .await;
        }
        self.report_task(&task_id, final_status.as_str(), 1.0).await;
        self.audit(
            "task_completed",
            &task_id,
            json!({
                "outcome": outcome,
                "duration_ms": duration_ms,
                "specialists": aggregate.specialists_used(),
                "failures": aggregate.failures.len(),
            }),
            outcome.as_str(),
            if success {
                AuditSeverity::Info
            } else {
                AuditSeverity::Warning
            },
        );

        self.transition(OrchestratorStatus::Idle)?;
        info!(
            "Task {} finished as {} in {}ms",
            task_id, outcome, duration_ms
        );

        Ok(ExecutionOutcome {
            task_id,
            success,
            result,
            error,
            outcome,
            duration_ms,
            specialists_used: aggregate.specialists_used(),
            confidence,
        })
    }

    /// Mark a task running unless it was cancelled while waiting
    fn claim_task(&self, mut task: Task) -> Option<Task> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let current = tasks.get(&task.task_id).map_or(task.status, |t| t.status);
        if current == TaskStatus::Cancelled {
            return None;
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(now_millis());
        task.completed_at = None;
        tasks.insert(task.task_id.clone(), task.clone());
        Some(task)
    }

    /// Fail a task the orchestrator cannot run in its current state
    ///
    /// The task is persisted as failed so it does not linger as pending.
    async fn refuse_execution(&self, task_id: &str, err: EngineError) -> ExecutionOutcome {
        warn!("Cannot execute {}: {}", task_id, err);
        let message = err.to_string();

        match self.find_task(task_id).await {
            Ok(Some(mut task)) if !task.status.is_terminal() => {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now_millis());
                task.errors.push(message.clone());
                self.store_task(&task);
                if let Err(e) = self
                    .ctx
                    .state
                    .update_task_status(task_id, TaskStatus::Failed, Some(&message))
                    .await
                {
                    warn!("Could not mark task {} failed: {:#}", task_id, e);
                }
                self.counters().tasks_failed += 1;
            }
            Ok(_) => {}
            Err(e) => warn!("Could not load task {}: {}", task_id, e),
        }

        self.audit(
            "task_execute",
            task_id,
            json!({ "error": message }),
            "rejected",
            AuditSeverity::Warning,
        );
        ExecutionOutcome::failure(task_id, TaskOutcome::Failure, message)
    }

    async fn handle_fault(
        &self,
        task_id: &str,
        err: EngineError,
        started: Instant,
    ) -> ExecutionOutcome {
        error!("Task {} failed: {}", task_id, err);
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            *status = OrchestratorStatus::Error;
        }

        let message = err.to_string();
        if let Some(mut task) = self.get_task(task_id) {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now_millis());
            task.errors.push(message.clone());
            self.store_task(&task);
        }
        if let Err(e) = self
            .ctx
            .state
            .update_task_status(task_id, TaskStatus::Failed, Some(&message))
            .await
        {
            warn!("Could not mark task {} failed: {:#}", task_id, e);
        }
        self.checkpoint(
            task_id,
            CheckpointType::Error,
            json!({ "error": message, "recoverable": err.is_recoverable() }),
            err.user_hint(),
        )
        .await;

        self.counters().tasks_failed += 1;
        self.audit(
            "task_failed",
            task_id,
            json!({ "error": message, "hint": err.user_hint() }),
            "error",
            AuditSeverity::Error,
        );
        self.ctx
            .bus
            .publish(Event::TaskFailed {
                task_id: task_id.to_string(),
                error: message.clone(),
            })
            .await;
        self.report_task(task_id, TaskStatus::Failed.as_str(), 1.0)
            .await;

        if let Err(e) = self.transition(OrchestratorStatus::Idle) {
            warn!("Could not recover to idle: {}", e);
        }

        let mut outcome = ExecutionOutcome::failure(task_id, TaskOutcome::Failure, message);
        outcome.duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        outcome
    }

    /// Mark a task cancelled unless it already finished
    ///
    /// Returns false for tasks that are already terminal. A task that has
    /// started running cannot be cancelled; one still queued behind another
    /// execution can.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, EngineError> {
        let found = self
            .find_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let task = tasks.entry(task_id.to_string()).or_insert(found);
            if task.status == TaskStatus::Running {
                return Err(EngineError::TaskAlreadyRunning(task_id.to_string()));
            }
            if task.status.is_terminal() {
                return Ok(false);
            }
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now_millis());
        }

        self.ctx
            .state
            .update_task_status(task_id, TaskStatus::Cancelled, None)
            .await
            .map_err(db_error)?;

        self.report_task(task_id, TaskStatus::Cancelled.as_str(), 0.0)
            .await;
        self.audit(
            "task_cancelled",
            task_id,
            json!({}),
            "success",
            AuditSeverity::Info,
        );
        info!("Cancelled task {}", task_id);
        Ok(true)
    }

    /// Load tasks a previous process left pending or running
    ///
    /// Interrupted running tasks are reset to pending. Returns their ids,
    /// oldest first, so the caller can execute them again.
    pub async fn recover(&self) -> Result<Vec<String>, EngineError> {
        let interrupted = self
            .ctx
            .state
            .recover_interrupted_tasks(&self.ctx.orchestrator_id)
            .await
            .map_err(db_error)?;

        let mut ids = Vec::with_capacity(interrupted.len());
        for state in &interrupted {
            let mut task = Task::from_state(state);
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                self.ctx
                    .state
                    .update_task_status(
                        &task.task_id,
                        TaskStatus::Pending,
                        Some("interrupted by restart"),
                    )
                    .await
                    .map_err(db_error)?;
                task.errors.push("interrupted by restart".to_string());
            }
            ids.push(task.task_id.clone());
            self.store_task(&task);
        }

        if !ids.is_empty() {
            self.audit(
                "tasks_recovered",
                &self.ctx.orchestrator_id,
                json!({ "task_ids": ids }),
                "success",
                AuditSeverity::Info,
            );
        }
        Ok(ids)
    }

    /// Disconnect from collaborators, flush the audit log and stop
    ///
    /// Waits for an executing task to finish first.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let _serial = self.execution.lock().await;
        if self.status() == OrchestratorStatus::Stopped {
            return Ok(());
        }
        self.transition(OrchestratorStatus::Stopped)?;

        if let Some(event_bus) = &self.ctx.collaborators.event_bus {
            if let Err(e) = event_bus.disconnect(&self.ctx.orchestrator_id).await {
                warn!("Event bus disconnect failed: {}", e);
            }
        }
        self.report_orchestrator_status("stopped").await;

        self.audit(
            "orchestrator_stopped",
            &self.ctx.orchestrator_id,
            json!({ "tasks_received": self.counters().tasks_received }),
            "success",
            AuditSeverity::Info,
        );
        self.ctx.audit.flush().await;
        if let Err(e) = self.ctx.state.database().flush_wal().await {
            warn!("WAL checkpoint on stop failed: {:#}", e);
        }
        self.ctx
            .bus
            .publish(Event::OrchestratorStopped {
                orchestrator_id: self.ctx.orchestrator_id.clone(),
            })
            .await;

        info!("{} stopped", self.ctx.orchestrator_id);
        Ok(())
    }

    pub fn statistics(&self) -> OrchestratorStatistics {
        let active_tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| t.status.is_active())
            .count();
        let counters = self.counters();
        let finished = counters.tasks_completed + counters.tasks_failed;

        OrchestratorStatistics {
            orchestrator_id: self.ctx.orchestrator_id.clone(),
            status: self.status(),
            tasks_received: counters.tasks_received,
            tasks_completed: counters.tasks_completed,
            tasks_failed: counters.tasks_failed,
            active_tasks,
            delegations_total: counters.delegations_total,
            delegations_successful: counters.delegations_successful,
            success_rate: if finished == 0 {
                0.0
            } else {
                counters.tasks_completed as f64 / finished as f64
            },
            specialists: self.ctx.registry.len(),
            experiences: self.ctx.learning.experience_count(),
            confidences: self.ctx.learning.confidences(),
        }
    }

    /// The newest `limit` audit entries, oldest first
    pub fn audit_log(&self, limit: usize) -> Vec<AuditEntry> {
        self.ctx.audit.recent(limit)
    }

    /// The newest `limit` experiences, oldest first
    pub fn experiences(&self, limit: usize) -> Vec<Experience> {
        self.ctx.learning.experiences(limit)
    }

    async fn checkpoint(
        &self,
        task_id: &str,
        checkpoint_type: CheckpointType,
        snapshot: Value,
        message: &str,
    ) {
        if let Err(e) = self
            .ctx
            .state
            .create_checkpoint(task_id, checkpoint_type, snapshot, message)
            .await
        {
            warn!("Checkpoint for task {} not written: {:#}", task_id, e);
        }
    }

    async fn report_task(&self, task_id: &str, status: &str, progress: f64) {
        if let Some(registry) = &self.ctx.collaborators.task_registry {
            if let Err(e) = registry.update_task(task_id, status, progress).await {
                self.collaborator_failed("task_registry_update", task_id, &e);
            }
        }
    }

    async fn report_orchestrator_status(&self, status: &str) {
        if let Some(registry) = &self.ctx.collaborators.task_registry {
            if let Err(e) = registry
                .update_orchestrator_status(&self.ctx.orchestrator_id, status)
                .await
            {
                self.collaborator_failed(
                    "task_registry_status",
                    &self.ctx.orchestrator_id,
                    &e,
                );
            }
        }
    }
}
