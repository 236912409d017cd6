//! Orchestration domain types
//!
//! Tasks, analyses, plans, delegation records and learning experiences as
//! they flow between the conductor components.

use anyhow::{anyhow, Result};
use sdk::{Capability, EngineError, SpecialistKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::db::{now_millis, TaskState};

pub use crate::db::TaskStatus;

/// Synthetic specialist id of the in-engine merge step
pub const MERGER_ID: &str = "merger";

/// Confidence assumed when nothing has been learned or reported
pub const DEFAULT_CONFIDENCE: f64 = 0.7;
pub const MIN_CONFIDENCE: f64 = 0.1;
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Random hex suffix for generated ids
pub fn short_id(prefix: &str, len: usize) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..len.min(hex.len())])
}

/// Sorted capability names joined with `_`
pub fn capability_signature(capabilities: &[Capability]) -> String {
    let mut names: Vec<&str> = capabilities.iter().map(|c| c.as_str()).collect();
    names.sort_unstable();
    names.join("_")
}

/// Task priority, lower value runs first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl TaskPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(TaskPriority::Critical),
            2 => Some(TaskPriority::High),
            3 => Some(TaskPriority::Normal),
            4 => Some(TaskPriority::Low),
            5 => Some(TaskPriority::Background),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
            TaskPriority::Background => "background",
        }
    }
}

impl FromStr for TaskPriority {
    type Err = anyhow::Error;

    /// Accepts a name ("high") or a numeric level ("2")
    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_lowercase();
        if let Ok(value) = lowered.parse::<u8>() {
            return TaskPriority::from_value(value)
                .ok_or_else(|| anyhow!("priority must be between 1 and 5, got {}", value));
        }
        [
            TaskPriority::Critical,
            TaskPriority::High,
            TaskPriority::Normal,
            TaskPriority::Low,
            TaskPriority::Background,
        ]
        .into_iter()
        .find(|p| p.as_str() == lowered)
        .ok_or_else(|| anyhow!("unknown priority '{}'", s))
    }
}

/// How a task is split across specialists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStrategy {
    Single,
    Parallel,
    Sequential,
    Collaborative,
}

impl DelegationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationStrategy::Single => "single",
            DelegationStrategy::Parallel => "parallel",
            DelegationStrategy::Sequential => "sequential",
            DelegationStrategy::Collaborative => "collaborative",
        }
    }
}

impl fmt::Display for DelegationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DelegationStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(DelegationStrategy::Single),
            "parallel" => Ok(DelegationStrategy::Parallel),
            "sequential" => Ok(DelegationStrategy::Sequential),
            "collaborative" => Ok(DelegationStrategy::Collaborative),
            other => Err(anyhow!("unknown delegation strategy '{}'", other)),
        }
    }
}

/// A task owned by one orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub context_id: String,
    pub prompt: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub required_capabilities: Vec<Capability>,
    pub delegations: Vec<DelegationRecord>,
    pub results: Vec<Value>,
    pub errors: Vec<String>,
    pub received_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub metadata: Value,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        context_id: impl Into<String>,
        prompt: impl Into<String>,
        priority: TaskPriority,
        metadata: Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            context_id: context_id.into(),
            prompt: prompt.into(),
            priority,
            status: TaskStatus::Pending,
            required_capabilities: Vec::new(),
            delegations: Vec::new(),
            results: Vec::new(),
            errors: Vec::new(),
            received_at: now_millis(),
            started_at: None,
            completed_at: None,
            metadata,
        }
    }

    /// Metadata value by key, when metadata is an object
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Persisted projection of this task
    pub fn to_state(&self, owner_id: &str, room_id: Option<i64>) -> TaskState {
        TaskState {
            task_id: self.task_id.clone(),
            owner_id: owner_id.to_string(),
            room_id,
            status: self.status,
            prompt: self.prompt.clone(),
            context: json!({
                "context_id": self.context_id,
                "priority": self.priority.value(),
                "required_capabilities": self.required_capabilities,
                "received_at": self.received_at,
            }),
            delegations: self
                .delegations
                .iter()
                .filter_map(|d| serde_json::to_value(d).ok())
                .collect(),
            results: self.results.clone(),
            errors: self.errors.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_checkpoint_at: None,
            metadata: self.metadata.clone(),
        }
    }

    /// Rebuild a task from its persisted projection
    ///
    /// Delegation records that no longer parse are dropped.
    pub fn from_state(state: &TaskState) -> Self {
        let context = &state.context;
        let priority = context
            .get("priority")
            .and_then(Value::as_u64)
            .and_then(|p| u8::try_from(p).ok())
            .and_then(TaskPriority::from_value)
            .unwrap_or_default();
        let required_capabilities = context
            .get("required_capabilities")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Self {
            task_id: state.task_id.clone(),
            context_id: context
                .get("context_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            prompt: state.prompt.clone(),
            priority,
            status: state.status,
            required_capabilities,
            delegations: state
                .delegations
                .iter()
                .filter_map(|d| serde_json::from_value(d.clone()).ok())
                .collect(),
            results: state.results.clone(),
            errors: state.errors.clone(),
            received_at: context
                .get("received_at")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_millis),
            started_at: state.started_at,
            completed_at: state.completed_at,
            metadata: state.metadata.clone(),
        }
    }
}

/// Result of analyzing a task prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAnalysis {
    pub task_id: String,
    pub required_capabilities: Vec<Capability>,
    pub complexity: f64,
    pub recommended_specialists: Vec<SpecialistKind>,
    pub strategy: DelegationStrategy,
    pub estimated_duration_secs: u64,
    pub confidence: f64,
    pub notes: Vec<String>,
}

impl TaskAnalysis {
    pub fn signature(&self) -> String {
        capability_signature(&self.required_capabilities)
    }
}

/// When a plan should be run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Immediate,
    Queued,
    Scheduled,
    Batched,
}

/// One delegation in a plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub step_id: String,
    pub specialist_id: String,
    pub capability: Capability,
    pub parallel: bool,
    pub depends_on: Vec<String>,
    pub step_number: u32,
}

impl PlanStep {
    pub fn is_merge(&self) -> bool {
        self.specialist_id == MERGER_ID
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub task_id: String,
    pub execution_mode: ExecutionMode,
    pub strategy: DelegationStrategy,
    pub priority: TaskPriority,
    pub estimated_duration_secs: u64,
    pub steps: Vec<PlanStep>,
    pub created_at: i64,
}

impl ExecutionPlan {
    /// Steps grouped by ascending step number, declared order kept inside a group
    pub fn groups(&self) -> Vec<Vec<&PlanStep>> {
        let mut groups: BTreeMap<u32, Vec<&PlanStep>> = BTreeMap::new();
        for step in &self.steps {
            groups.entry(step.step_number).or_default().push(step);
        }
        groups.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Delegation status. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
    SendFailed,
}

impl DelegationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationStatus::Pending => "pending",
            DelegationStatus::Processing => "processing",
            DelegationStatus::Completed => "completed",
            DelegationStatus::Failed => "failed",
            DelegationStatus::Timeout => "timeout",
            DelegationStatus::SendFailed => "send_failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DelegationStatus::Pending => 0,
            DelegationStatus::Processing => 1,
            _ => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DelegationStatus::Failed | DelegationStatus::Timeout | DelegationStatus::SendFailed
        )
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One assignment of a plan step to a specialist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegationRecord {
    pub delegation_id: String,
    pub task_id: String,
    pub step_id: String,
    pub specialist_id: String,
    pub capability: Capability,
    pub status: DelegationStatus,
    pub delegated_at: i64,
    pub completed_at: Option<i64>,
    pub input: Value,
    pub output: Option<Value>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

impl DelegationRecord {
    pub fn new(task_id: &str, step: &PlanStep, input: Value) -> Self {
        Self {
            delegation_id: short_id("del", 12),
            task_id: task_id.to_string(),
            step_id: step.step_id.clone(),
            specialist_id: step.specialist_id.clone(),
            capability: step.capability,
            status: DelegationStatus::Pending,
            delegated_at: now_millis(),
            completed_at: None,
            input,
            output: None,
            confidence: None,
            error: None,
        }
    }

    /// Advance the status; regressions and moves out of a terminal state fail
    pub fn transition(&mut self, next: DelegationStatus) -> Result<(), EngineError> {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return Err(EngineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now_millis());
        }
        Ok(())
    }

    /// Delegation wall time in milliseconds, once finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at.map(|done| (done - self.delegated_at).max(0))
    }
}

/// Overall outcome of a task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    PartialSuccess,
    Failure,
    Cancelled,
    Timeout,
    RequiresHuman,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::PartialSuccess => "partial_success",
            TaskOutcome::Failure => "failure",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::Timeout => "timeout",
            TaskOutcome::RequiresHuman => "requires_human",
        }
    }

    /// Learned confidence adjustment for this outcome
    pub fn confidence_delta(&self) -> f64 {
        match self {
            TaskOutcome::Success => 0.05,
            TaskOutcome::Failure | TaskOutcome::Timeout => -0.05,
            _ => 0.0,
        }
    }

    /// Status persisted for a task that ended with this outcome
    pub fn final_status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Success => TaskStatus::Completed,
            TaskOutcome::Timeout => TaskStatus::Timeout,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "success" => TaskOutcome::Success,
            "partial_success" => TaskOutcome::PartialSuccess,
            "failure" => TaskOutcome::Failure,
            "cancelled" => TaskOutcome::Cancelled,
            "timeout" => TaskOutcome::Timeout,
            "requires_human" => TaskOutcome::RequiresHuman,
            other => return Err(anyhow!("unknown task outcome '{}'", other)),
        })
    }
}

/// A learning record, appended once per executed task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experience {
    pub experience_id: String,
    pub task_id: String,
    pub signature: String,
    pub outcome: TaskOutcome,
    pub duration_ms: i64,
    pub specialists_used: Vec<String>,
    pub strategy: DelegationStrategy,
    pub success_factors: Vec<String>,
    pub failure_factors: Vec<String>,
    pub lessons_learned: Vec<String>,
    pub confidence_delta: f64,
    pub created_at: i64,
}

/// Output of a successful step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub specialist_id: String,
    pub capability: Capability,
    pub output: Value,
    pub confidence: f64,
}

/// A step that did not complete
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFailure {
    pub step_id: String,
    pub specialist_id: String,
    pub status: DelegationStatus,
    pub error: String,
}

/// Everything a plan execution produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateResult {
    pub plan_id: String,
    pub task_id: String,
    pub success: bool,
    pub total_steps: usize,
    pub results: Vec<StepResult>,
    pub failures: Vec<StepFailure>,
    pub delegations: Vec<DelegationRecord>,
}

impl AggregateResult {
    /// Success means failures are strictly fewer than half of the steps
    pub fn compute_success(total_steps: usize, failures: usize) -> bool {
        total_steps > 0 && failures * 2 < total_steps
    }

    /// Outputs of successful steps keyed by specialist id
    pub fn combined_output(&self) -> Value {
        let mut combined = serde_json::Map::new();
        for result in &self.results {
            let key = if combined.contains_key(&result.specialist_id) {
                format!("{}:{}", result.specialist_id, result.capability)
            } else {
                result.specialist_id.clone()
            };
            combined.insert(key, result.output.clone());
        }
        Value::Object(combined)
    }

    /// Mean confidence of successful steps
    pub fn mean_confidence(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().map(|r| r.confidence).sum::<f64>() / self.results.len() as f64
    }

    pub fn outcome(&self) -> TaskOutcome {
        if self.total_steps == 0 {
            TaskOutcome::RequiresHuman
        } else if self.success {
            TaskOutcome::Success
        } else if self.results.is_empty() {
            // A merge with nothing to merge only echoes its sources' failures
            let mut delegated = self
                .failures
                .iter()
                .filter(|f| f.specialist_id != MERGER_ID)
                .peekable();
            if delegated.peek().is_some()
                && delegated.all(|f| f.status == DelegationStatus::Timeout)
            {
                TaskOutcome::Timeout
            } else {
                TaskOutcome::Failure
            }
        } else {
            TaskOutcome::PartialSuccess
        }
    }

    /// Distinct specialist ids that took part, in first-seen order. The merge
    /// step is not a specialist and is left out.
    pub fn specialists_used(&self) -> Vec<String> {
        let mut used: Vec<String> = Vec::new();
        for record in &self.delegations {
            if record.specialist_id != MERGER_ID && !used.contains(&record.specialist_id) {
                used.push(record.specialist_id.clone());
            }
        }
        used
    }

    pub fn successful_specialists(&self) -> Vec<String> {
        self.results.iter().map(|r| r.specialist_id.clone()).collect()
    }

    pub fn failed_specialists(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.specialist_id.clone()).collect()
    }

    /// First failure message, used as the task error when nothing succeeded
    pub fn error_summary(&self) -> Option<String> {
        if self.total_steps == 0 {
            return Some("No specialist available for the required capabilities".to_string());
        }
        if self.results.is_empty() {
            return Some("All delegations failed".to_string());
        }
        if !self.success {
            return Some(format!(
                "{} of {} delegations failed",
                self.failures.len(),
                self.total_steps
            ));
        }
        None
    }
}

/// Acknowledgement returned by `receive_task`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReceipt {
    pub task_id: String,
    pub status: String,
    pub orchestrator_id: String,
    pub received_at: i64,
}

/// Structured result of `execute_task`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    pub task_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub outcome: TaskOutcome,
    pub duration_ms: i64,
    pub specialists_used: Vec<String>,
    pub confidence: f64,
}

impl ExecutionOutcome {
    pub fn failure(task_id: &str, outcome: TaskOutcome, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            result: None,
            error: Some(error.into()),
            outcome,
            duration_ms: 0,
            specialists_used: Vec::new(),
            confidence: 0.0,
        }
    }
}

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Initializing,
    Idle,
    Analyzing,
    Delegating,
    Monitoring,
    Learning,
    Error,
    Stopped,
}

impl OrchestratorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorStatus::Initializing => "initializing",
            OrchestratorStatus::Idle => "idle",
            OrchestratorStatus::Analyzing => "analyzing",
            OrchestratorStatus::Delegating => "delegating",
            OrchestratorStatus::Monitoring => "monitoring",
            OrchestratorStatus::Learning => "learning",
            OrchestratorStatus::Error => "error",
            OrchestratorStatus::Stopped => "stopped",
        }
    }

    /// States in which a task is being worked on
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrchestratorStatus::Analyzing
                | OrchestratorStatus::Delegating
                | OrchestratorStatus::Monitoring
                | OrchestratorStatus::Learning
        )
    }

    pub fn can_transition_to(&self, next: OrchestratorStatus) -> bool {
        use OrchestratorStatus::*;
        match (self, next) {
            (Initializing, Idle) | (Initializing, Error) => true,
            (Idle, Analyzing) | (Idle, Stopped) => true,
            (Analyzing, Delegating) | (Analyzing, Idle) => true,
            (Delegating, Monitoring) => true,
            (Monitoring, Learning) | (Monitoring, Idle) => true,
            (Learning, Idle) => true,
            (Error, Idle) | (Error, Stopped) => true,
            (from, Error) => from.is_active(),
            _ => false,
        }
    }
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
