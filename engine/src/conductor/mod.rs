//! Conductor System
//!
//! Task delegation and orchestration: analysis, specialist selection,
//! planning, delegated execution, learning and auditing, tied together by
//! the `Orchestrator`.

pub mod analyzer;
pub mod audit;
pub mod channel;
pub mod context;
pub mod executor;
pub mod learning;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod types;

pub use analyzer::{AnalyzerSettings, TaskAnalyzer};
pub use audit::{AuditEntry, AuditLog, AuditSeverity, AuditSink};
pub use channel::{LocalSpecialistChannel, SimulatedSpecialist, SpecialistHandler};
pub use context::{OrchestratorContext, OrchestratorSettings};
pub use executor::{DelegationEngine, DispatchHandle};
pub use learning::LearningLoop;
pub use orchestrator::{Orchestrator, OrchestratorStatistics};
pub use planner::TaskPlanner;
pub use registry::{Availability, LoadGuard, SpecialistInfo, SpecialistRegistry};
pub use types::{
    AggregateResult, DelegationRecord, DelegationStatus, DelegationStrategy, ExecutionMode,
    ExecutionOutcome, ExecutionPlan, Experience, OrchestratorStatus, PlanStep, Task,
    TaskAnalysis, TaskOutcome, TaskPriority, TaskReceipt, TaskStatus,
};
