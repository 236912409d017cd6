//! Delegation engine
//!
//! Runs an `ExecutionPlan` group by group. Steps in a parallel group are
//! dispatched together and joined; other steps run in declared order and see
//! the outputs of the steps they depend on. Every delegation is bounded by
//! the configured timeout and holds a load slot on its specialist for exactly
//! as long as the call is in flight.

use sdk::{EngineError, SpecialistChannel, SpecialistRequest, SpecialistResponse};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{CheckpointType, StateManager};
use crate::message_bus::{Event, MessageBus};

use super::registry::SpecialistRegistry;
use super::types::{
    AggregateResult, DelegationRecord, DelegationStatus, ExecutionPlan, PlanStep, StepFailure,
    StepResult, DEFAULT_CONFIDENCE,
};

pub const DEFAULT_DELEGATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Executes plans against the specialist channel
#[derive(Clone)]
pub struct DelegationEngine {
    registry: SpecialistRegistry,
    channel: Arc<dyn SpecialistChannel>,
    state: Option<StateManager>,
    bus: Option<Arc<MessageBus>>,
    timeout: Duration,
}

/// A plan running in the background
pub struct DispatchHandle {
    /// Fraction of execution groups finished, 0.0 to 1.0
    pub progress: watch::Receiver<f64>,
    handle: JoinHandle<AggregateResult>,
}

impl DispatchHandle {
    /// Wait for the plan to finish
    pub async fn wait(self) -> Result<AggregateResult, EngineError> {
        self.handle
            .await
            .map_err(|e| EngineError::OrchestratorFault(format!("plan execution aborted: {}", e)))
    }
}

impl DelegationEngine {
    pub fn new(registry: SpecialistRegistry, channel: Arc<dyn SpecialistChannel>) -> Self {
        Self {
            registry,
            channel,
            state: None,
            bus: None,
            timeout: DEFAULT_DELEGATION_TIMEOUT,
        }
    }

    /// Record checkpoints and specialist metrics in `state`
    pub fn with_state(mut self, state: StateManager) -> Self {
        self.state = Some(state);
        self
    }

    /// Publish delegation and progress events on `bus`
    pub fn with_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawn the plan and return a handle to its progress and result
    pub fn dispatch(&self, plan: ExecutionPlan, input: Value) -> DispatchHandle {
        let (tx, rx) = watch::channel(0.0);
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_plan(&plan, input, Some(tx)).await });
        DispatchHandle {
            progress: rx,
            handle,
        }
    }

    /// Execute the plan and wait for every group
    pub async fn execute_plan(&self, plan: &ExecutionPlan, input: Value) -> AggregateResult {
        self.run_plan(plan, input, None).await
    }

    /// Single call to a specialist, bounded by the delegation timeout
    pub async fn invoke_specialist(
        &self,
        specialist_id: &str,
        request: SpecialistRequest,
    ) -> Result<SpecialistResponse, EngineError> {
        match tokio::time::timeout(self.timeout, self.channel.invoke(specialist_id, request)).await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::DelegationTimeout {
                specialist_id: specialist_id.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }

    async fn run_plan(
        &self,
        plan: &ExecutionPlan,
        input: Value,
        progress: Option<watch::Sender<f64>>,
    ) -> AggregateResult {
        let groups = plan.groups();
        let total_groups = groups.len();
        let mut finished: HashMap<String, StepResult> = HashMap::new();
        let mut results = Vec::new();
        let mut failures = Vec::new();
        let mut delegations = Vec::new();

        info!(
            "Executing plan {} for task {}: {} step(s) in {} group(s)",
            plan.plan_id,
            plan.task_id,
            plan.steps.len(),
            total_groups
        );

        for (index, group) in groups.into_iter().enumerate() {
            let records = if group.len() > 1 && group.iter().all(|s| s.parallel) {
                let calls = group.iter().map(|step| {
                    let step_input = with_dependencies(&input, step, &finished);
                    self.run_step(plan, step, step_input, &finished)
                });
                futures::future::join_all(calls).await
            } else {
                let mut records = Vec::with_capacity(group.len());
                for step in group {
                    let step_input = with_dependencies(&input, step, &finished);
                    let record = self.run_step(plan, step, step_input, &finished).await;
                    if let Some(result) = step_result(&record) {
                        finished.insert(result.step_id.clone(), result);
                    }
                    records.push(record);
                }
                records
            };

            for record in records {
                match step_result(&record) {
                    Some(result) => {
                        finished.insert(result.step_id.clone(), result.clone());
                        results.push(result);
                    }
                    None => failures.push(StepFailure {
                        step_id: record.step_id.clone(),
                        specialist_id: record.specialist_id.clone(),
                        status: record.status,
                        error: record
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("delegation {}", record.status)),
                    }),
                }
                delegations.push(record);
            }

            let fraction = (index + 1) as f64 / total_groups as f64;
            self.report_progress(plan, fraction, index + 1, total_groups, progress.as_ref())
                .await;
        }

        let total_steps = plan.steps.len();
        let success = AggregateResult::compute_success(total_steps, failures.len());
        if total_steps > 0 {
            info!(
                "Plan {} finished: {}/{} step(s) succeeded",
                plan.plan_id,
                results.len(),
                total_steps
            );
        }

        AggregateResult {
            plan_id: plan.plan_id.clone(),
            task_id: plan.task_id.clone(),
            success,
            total_steps,
            results,
            failures,
            delegations,
        }
    }

    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        step: &PlanStep,
        input: Value,
        finished: &HashMap<String, StepResult>,
    ) -> DelegationRecord {
        let mut record = DelegationRecord::new(&plan.task_id, step, input.clone());
        if step.is_merge() {
            merge_dependencies(&mut record, step, finished);
            self.publish_delegation(&record).await;
            return record;
        }

        // Slot is taken right before the call and released on every path out
        let guard = match self.registry.acquire(&step.specialist_id) {
            Ok(guard) => guard,
            Err(e) => {
                advance(&mut record, DelegationStatus::SendFailed);
                record.error = Some(e.to_string());
                self.publish_delegation(&record).await;
                return record;
            }
        };

        advance(&mut record, DelegationStatus::Processing);
        self.publish_delegation(&record).await;
        self.checkpoint(
            &plan.task_id,
            CheckpointType::DelegationStart,
            json!({
                "delegation_id": record.delegation_id,
                "step_id": step.step_id,
                "specialist_id": step.specialist_id,
            }),
            &format!("Delegated {} to {}", step.capability, step.specialist_id),
        )
        .await;

        let request = SpecialistRequest {
            delegation_id: record.delegation_id.clone(),
            task_id: plan.task_id.clone(),
            input,
        };
        let started = Instant::now();
        let response = self.invoke_specialist(&step.specialist_id, request).await;
        drop(guard);
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        match response {
            Ok(response) if response.success => {
                advance(&mut record, DelegationStatus::Completed);
                record.output = Some(response.output);
                record.confidence = response.confidence;
            }
            Ok(response) => {
                advance(&mut record, DelegationStatus::Failed);
                record.output = Some(response.output).filter(|v| !v.is_null());
                record.error = Some(
                    response
                        .error
                        .unwrap_or_else(|| "specialist reported failure".to_string()),
                );
            }
            Err(e @ EngineError::DelegationTimeout { .. }) => {
                warn!("{}", e);
                advance(&mut record, DelegationStatus::Timeout);
                record.error = Some(e.to_string());
            }
            Err(e @ EngineError::DelegationSend { .. }) => {
                warn!("{}", e);
                advance(&mut record, DelegationStatus::SendFailed);
                record.error = Some(e.to_string());
            }
            Err(e) => {
                warn!("Delegation {} failed: {}", record.delegation_id, e);
                advance(&mut record, DelegationStatus::Failed);
                record.error = Some(e.to_string());
            }
        }

        let success = record.status == DelegationStatus::Completed;
        let score = self
            .registry
            .record_result(&step.specialist_id, success, elapsed_ms);
        self.mirror_metrics(&step.specialist_id, success, elapsed_ms, score)
            .await;

        self.publish_delegation(&record).await;
        self.checkpoint(
            &plan.task_id,
            CheckpointType::DelegationComplete,
            json!({
                "delegation_id": record.delegation_id,
                "step_id": step.step_id,
                "status": record.status,
                "duration_ms": elapsed_ms,
            }),
            &format!("Delegation to {} {}", step.specialist_id, record.status),
        )
        .await;

        debug!(
            "Step {} on {} finished as {} in {}ms",
            step.step_id, step.specialist_id, record.status, elapsed_ms
        );
        record
    }

    async fn mirror_metrics(
        &self,
        specialist_id: &str,
        success: bool,
        elapsed_ms: i64,
        score: Option<f64>,
    ) {
        let Some(state) = &self.state else {
            return;
        };
        match state
            .record_specialist_result(specialist_id, success, elapsed_ms, score)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                if let Some(metrics) = self.registry.metrics(specialist_id) {
                    if let Err(e) = state.save_specialist_metrics(&metrics).await {
                        warn!("Failed to save metrics for {}: {:#}", specialist_id, e);
                    }
                }
            }
            Err(e) => warn!("Failed to record result for {}: {:#}", specialist_id, e),
        }
    }

    async fn report_progress(
        &self,
        plan: &ExecutionPlan,
        fraction: f64,
        completed_groups: usize,
        total_groups: usize,
        progress: Option<&watch::Sender<f64>>,
    ) {
        if let Some(tx) = progress {
            let _ = tx.send(fraction);
        }
        if let Some(bus) = &self.bus {
            bus.publish(Event::PlanProgress {
                task_id: plan.task_id.clone(),
                plan_id: plan.plan_id.clone(),
                progress: fraction,
            })
            .await;
        }
        self.checkpoint(
            &plan.task_id,
            CheckpointType::TaskProgress,
            json!({
                "plan_id": plan.plan_id,
                "progress": fraction,
                "completed_groups": completed_groups,
                "total_groups": total_groups,
            }),
            &format!("Completed group {} of {}", completed_groups, total_groups),
        )
        .await;
    }

    async fn publish_delegation(&self, record: &DelegationRecord) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::DelegationUpdated {
                delegation_id: record.delegation_id.clone(),
                task_id: record.task_id.clone(),
                specialist_id: record.specialist_id.clone(),
                status: record.status.to_string(),
            })
            .await;
        }
    }

    async fn checkpoint(
        &self,
        task_id: &str,
        checkpoint_type: CheckpointType,
        snapshot: Value,
        message: &str,
    ) {
        if let Some(state) = &self.state {
            if let Err(e) = state
                .create_checkpoint(task_id, checkpoint_type, snapshot, message)
                .await
            {
                debug!("Checkpoint for task {} not written: {:#}", task_id, e);
            }
        }
    }
}

fn advance(record: &mut DelegationRecord, next: DelegationStatus) {
    if let Err(e) = record.transition(next) {
        warn!("Delegation {}: {}", record.delegation_id, e);
    }
}

fn step_result(record: &DelegationRecord) -> Option<StepResult> {
    if record.status != DelegationStatus::Completed {
        return None;
    }
    Some(StepResult {
        step_id: record.step_id.clone(),
        specialist_id: record.specialist_id.clone(),
        capability: record.capability,
        output: record.output.clone().unwrap_or(Value::Null),
        confidence: record.confidence.unwrap_or(DEFAULT_CONFIDENCE),
    })
}

/// Step input with the outputs of its finished dependencies under `from_<step_id>`
fn with_dependencies(
    input: &Value,
    step: &PlanStep,
    finished: &HashMap<String, StepResult>,
) -> Value {
    if step.depends_on.is_empty() || step.is_merge() {
        return input.clone();
    }

    let mut object = match input {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    };
    for dep in &step.depends_on {
        if let Some(prior) = finished.get(dep) {
            object.insert(format!("from_{}", dep), prior.output.clone());
        }
    }
    Value::Object(object)
}

/// Combine the outputs of the merge step's dependencies without a specialist call
fn merge_dependencies(
    record: &mut DelegationRecord,
    step: &PlanStep,
    finished: &HashMap<String, StepResult>,
) {
    advance(record, DelegationStatus::Processing);

    let sources: Vec<&StepResult> = step
        .depends_on
        .iter()
        .filter_map(|dep| finished.get(dep))
        .collect();
    if sources.is_empty() {
        advance(record, DelegationStatus::Failed);
        record.error = Some("no successful results to merge".to_string());
        return;
    }

    let mut merged = Map::new();
    for source in &sources {
        let key = if merged.contains_key(&source.specialist_id) {
            format!("{}:{}", source.specialist_id, source.capability)
        } else {
            source.specialist_id.clone()
        };
        merged.insert(key, source.output.clone());
    }
    let confidence =
        sources.iter().map(|s| s.confidence).sum::<f64>() / sources.len() as f64;

    advance(record, DelegationStatus::Completed);
    record.output = Some(json!({
        "merged_results": merged,
        "source_count": sources.len(),
    }));
    record.confidence = Some(confidence);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::channel::{LocalSpecialistChannel, SimulatedSpecialist, SpecialistHandler};
    use crate::conductor::types::{DelegationStrategy, ExecutionMode, TaskPriority, MERGER_ID};
    use async_trait::async_trait;
    use sdk::{Capability, SpecialistKind};
    use std::sync::Mutex;

    /// Records the input each specialist received
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl SpecialistHandler for Recorder {
        async fn handle(&self, specialist_id: &str, request: SpecialistRequest) -> SpecialistResponse {
            self.seen
                .lock()
                .unwrap()
                .push((specialist_id.to_string(), request.input.clone()));
            SpecialistResponse::ok(json!(format!("out-{}", specialist_id)), Some(0.9))
        }
    }

    fn registry() -> SpecialistRegistry {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("doc", SpecialistKind::DocumentSpecialist, &[], 2)
            .unwrap();
        registry
            .register_specialist("res", SpecialistKind::ResearchSpecialist, &[], 2)
            .unwrap();
        registry
            .register_specialist("wri", SpecialistKind::CreativeSynthesizer, &[], 2)
            .unwrap();
        registry
    }

    fn step(
        id: &str,
        specialist: &str,
        cap: Capability,
        number: u32,
        parallel: bool,
        deps: &[&str],
    ) -> PlanStep {
        PlanStep {
            step_id: id.to_string(),
            specialist_id: specialist.to_string(),
            capability: cap,
            parallel,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            step_number: number,
        }
    }

    fn plan(strategy: DelegationStrategy, steps: Vec<PlanStep>) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: "plan_test".to_string(),
            task_id: "task-1".to_string(),
            execution_mode: ExecutionMode::Queued,
            strategy,
            priority: TaskPriority::Normal,
            estimated_duration_secs: 10,
            steps,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_sequential_steps_see_only_declared_dependencies() {
        let recorder = Arc::new(Recorder::default());
        let engine = DelegationEngine::new(
            registry(),
            Arc::new(LocalSpecialistChannel::with_fallback(recorder.clone())),
        );
        let plan = plan(
            DelegationStrategy::Sequential,
            vec![
                step("s1", "res", Capability::Research, 1, false, &[]),
                step("s2", "wri", Capability::CreativeWriting, 2, false, &["s1"]),
                step("s3", "doc", Capability::DocumentAnalysis, 3, false, &["s2"]),
            ],
        );

        let aggregate = engine.execute_plan(&plan, json!({"prompt": "p"})).await;
        assert!(aggregate.success);
        assert_eq!(aggregate.results.len(), 3);

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0].1, json!({"prompt": "p"}));
        assert_eq!(seen[1].1["from_s1"], json!("out-res"));
        assert_eq!(seen[2].1["from_s2"], json!("out-wri"));
        assert!(seen[2].1.get("from_s1").is_none());
    }

    #[tokio::test]
    async fn test_collaborative_merge_combines_sources() {
        let engine = DelegationEngine::new(
            registry(),
            Arc::new(LocalSpecialistChannel::with_fallback(Arc::new(
                SimulatedSpecialist::new().with_confidence(Some(0.6)),
            ))),
        );
        let plan = plan(
            DelegationStrategy::Collaborative,
            vec![
                step("a", "res", Capability::Research, 1, true, &[]),
                step("b", "wri", Capability::CreativeWriting, 1, true, &[]),
                step("m", MERGER_ID, Capability::MergeResults, 2, false, &["a", "b"]),
            ],
        );

        let aggregate = engine.execute_plan(&plan, json!("input")).await;
        assert!(aggregate.success);
        let merge = aggregate.results.iter().find(|r| r.step_id == "m").unwrap();
        assert_eq!(merge.output["source_count"], 2);
        assert!(merge.output["merged_results"].get("res").is_some());
        assert!(merge.output["merged_results"].get("wri").is_some());
        assert!((merge.confidence - 0.6).abs() < 1e-9);
        assert_eq!(aggregate.specialists_used(), vec!["res".to_string(), "wri".to_string()]);
    }

    #[tokio::test]
    async fn test_failures_and_missing_confidence() {
        let channel = LocalSpecialistChannel::new();
        channel.register("res", Arc::new(SimulatedSpecialist::new().with_confidence(None)));
        channel.register("wri", Arc::new(SimulatedSpecialist::new().failing("writer down")));
        let reg = registry();
        let engine = DelegationEngine::new(reg.clone(), Arc::new(channel));
        let plan = plan(
            DelegationStrategy::Parallel,
            vec![
                step("a", "res", Capability::Research, 1, true, &[]),
                step("b", "wri", Capability::CreativeWriting, 1, true, &[]),
                step("c", "doc", Capability::DocumentAnalysis, 1, true, &[]),
            ],
        );

        let aggregate = engine.execute_plan(&plan, json!({})).await;
        // 2 failures out of 3 steps
        assert!(!aggregate.success);
        assert_eq!(aggregate.results.len(), 1);
        assert!((aggregate.results[0].confidence - DEFAULT_CONFIDENCE).abs() < 1e-9);

        let statuses: HashMap<&str, DelegationStatus> = aggregate
            .delegations
            .iter()
            .map(|d| (d.specialist_id.as_str(), d.status))
            .collect();
        assert_eq!(statuses["wri"], DelegationStatus::Failed);
        assert_eq!(statuses["doc"], DelegationStatus::SendFailed);
        assert_eq!(reg.get("wri").unwrap().failure_count, 1);
        assert!(reg.list().iter().all(|s| s.current_load == 0));
    }

    #[tokio::test]
    async fn test_empty_plan_is_not_a_success() {
        let engine = DelegationEngine::new(registry(), Arc::new(LocalSpecialistChannel::new()));
        let aggregate = engine
            .execute_plan(&plan(DelegationStrategy::Single, Vec::new()), json!({}))
            .await;
        assert!(!aggregate.success);
        assert_eq!(aggregate.total_steps, 0);
    }

    #[tokio::test]
    async fn test_dispatch_reports_progress() {
        let engine = DelegationEngine::new(
            registry(),
            Arc::new(LocalSpecialistChannel::with_fallback(Arc::new(SimulatedSpecialist::new()))),
        );
        let plan = plan(
            DelegationStrategy::Sequential,
            vec![
                step("s1", "res", Capability::Research, 1, false, &[]),
                step("s2", "wri", Capability::CreativeWriting, 2, false, &["s1"]),
            ],
        );

        let handle = engine.dispatch(plan, json!({}));
        let progress = handle.progress.clone();
        let aggregate = handle.wait().await.unwrap();
        assert!(aggregate.success);
        assert!((*progress.borrow() - 1.0).abs() < 1e-9);
    }
}
