//! Execution planning
//!
//! Turns a `TaskAnalysis` into an `ExecutionPlan` by assigning one specialist
//! per required capability and laying the steps out according to the
//! delegation strategy.

use sdk::Capability;
use tracing::{debug, warn};

use crate::db::now_millis;

use super::registry::SpecialistRegistry;
use super::types::{
    short_id, DelegationStrategy, ExecutionMode, ExecutionPlan, PlanStep, TaskAnalysis,
    TaskPriority, MERGER_ID,
};

/// Plans with more steps than this are batched
const BATCH_THRESHOLD: usize = 3;

pub struct TaskPlanner {
    registry: SpecialistRegistry,
    prefer_performance: bool,
}

impl TaskPlanner {
    pub fn new(registry: SpecialistRegistry, prefer_performance: bool) -> Self {
        Self {
            registry,
            prefer_performance,
        }
    }

    pub fn create_plan(
        &self,
        task_id: &str,
        analysis: &TaskAnalysis,
        priority: TaskPriority,
    ) -> ExecutionPlan {
        let assignments = self.registry.select_specialists_for_capabilities(
            &analysis.required_capabilities,
            self.prefer_performance,
        );

        if assignments.len() < analysis.required_capabilities.len() {
            warn!(
                "Task {}: {} of {} capabilities have no specialist",
                task_id,
                analysis.required_capabilities.len() - assignments.len(),
                analysis.required_capabilities.len()
            );
        }

        let steps = match analysis.strategy {
            DelegationStrategy::Single => assignments
                .into_iter()
                .take(1)
                .map(|(cap, id)| new_step(id, cap, false, Vec::new(), 1))
                .collect(),
            DelegationStrategy::Parallel => assignments
                .into_iter()
                .map(|(cap, id)| new_step(id, cap, true, Vec::new(), 1))
                .collect(),
            DelegationStrategy::Sequential => {
                let mut steps: Vec<PlanStep> = Vec::with_capacity(assignments.len());
                for (index, (cap, id)) in assignments.into_iter().enumerate() {
                    let depends_on = steps
                        .last()
                        .map(|prev| vec![prev.step_id.clone()])
                        .unwrap_or_default();
                    steps.push(new_step(id, cap, false, depends_on, index as u32 + 1));
                }
                steps
            }
            DelegationStrategy::Collaborative => {
                let mut steps: Vec<PlanStep> = assignments
                    .into_iter()
                    .map(|(cap, id)| new_step(id, cap, true, Vec::new(), 1))
                    .collect();
                if !steps.is_empty() {
                    let sources = steps.iter().map(|s| s.step_id.clone()).collect();
                    steps.push(new_step(
                        MERGER_ID.to_string(),
                        Capability::MergeResults,
                        false,
                        sources,
                        2,
                    ));
                }
                steps
            }
        };

        let execution_mode = if priority == TaskPriority::Critical {
            ExecutionMode::Immediate
        } else if steps.len() > BATCH_THRESHOLD {
            ExecutionMode::Batched
        } else {
            ExecutionMode::Queued
        };

        let plan = ExecutionPlan {
            plan_id: short_id("plan", 12),
            task_id: task_id.to_string(),
            execution_mode,
            strategy: analysis.strategy,
            priority,
            estimated_duration_secs: analysis.estimated_duration_secs,
            steps,
            created_at: now_millis(),
        };

        debug!(
            "Created plan {} for task {}: {} step(s), {}",
            plan.plan_id,
            task_id,
            plan.steps.len(),
            plan.strategy
        );
        plan
    }
}

fn new_step(
    specialist_id: String,
    capability: Capability,
    parallel: bool,
    depends_on: Vec<String>,
    step_number: u32,
) -> PlanStep {
    PlanStep {
        step_id: short_id("step", 8),
        specialist_id,
        capability,
        parallel,
        depends_on,
        step_number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::SpecialistKind;

    fn planner() -> TaskPlanner {
        let registry = SpecialistRegistry::new();
        registry.register_defaults(5).unwrap();
        TaskPlanner::new(registry, true)
    }

    fn analysis(caps: Vec<Capability>, strategy: DelegationStrategy) -> TaskAnalysis {
        TaskAnalysis {
            task_id: "t".to_string(),
            recommended_specialists: caps.iter().filter_map(|c| c.specialist_kind()).collect(),
            required_capabilities: caps,
            complexity: 0.5,
            strategy,
            estimated_duration_secs: 10,
            confidence: 0.7,
            notes: Vec::new(),
        }
    }

    #[test]
    fn test_single_strategy_has_one_step() {
        let plan = planner().create_plan(
            "t",
            &analysis(
                vec![Capability::DocumentAnalysis, Capability::DocumentSummary],
                DelegationStrategy::Single,
            ),
            TaskPriority::Normal,
        );
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].capability, Capability::DocumentAnalysis);
        assert_eq!(plan.steps[0].step_number, 1);
        assert_eq!(plan.execution_mode, ExecutionMode::Queued);
        assert!(plan.plan_id.starts_with("plan_") && plan.plan_id.len() == 17);
        assert!(plan.steps[0].step_id.starts_with("step_") && plan.steps[0].step_id.len() == 13);
    }

    #[test]
    fn test_sequential_steps_chain() {
        let plan = planner().create_plan(
            "t",
            &analysis(
                vec![Capability::Research, Capability::CreativeWriting],
                DelegationStrategy::Sequential,
            ),
            TaskPriority::Normal,
        );
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].step_number, 1);
        assert!(plan.steps[0].depends_on.is_empty());
        assert_eq!(plan.steps[1].step_number, 2);
        assert_eq!(plan.steps[1].depends_on, vec![plan.steps[0].step_id.clone()]);
    }

    #[test]
    fn test_parallel_steps_share_group() {
        let plan = planner().create_plan(
            "t",
            &analysis(
                vec![
                    Capability::DocumentAnalysis,
                    Capability::Research,
                    Capability::CreativeWriting,
                    Capability::KnowledgeExtraction,
                ],
                DelegationStrategy::Parallel,
            ),
            TaskPriority::High,
        );
        assert_eq!(plan.steps.len(), 4);
        assert!(plan.steps.iter().all(|s| s.step_number == 1 && s.parallel));
        assert_eq!(plan.execution_mode, ExecutionMode::Batched);
    }

    #[test]
    fn test_collaborative_adds_merge_step() {
        let plan = planner().create_plan(
            "t",
            &analysis(
                vec![Capability::Research, Capability::CreativeWriting],
                DelegationStrategy::Collaborative,
            ),
            TaskPriority::Critical,
        );
        assert_eq!(plan.steps.len(), 3);
        let merge = &plan.steps[2];
        assert!(merge.is_merge());
        assert_eq!(merge.capability, Capability::MergeResults);
        assert_eq!(merge.step_number, 2);
        assert_eq!(
            merge.depends_on,
            vec![plan.steps[0].step_id.clone(), plan.steps[1].step_id.clone()]
        );
        assert_eq!(plan.execution_mode, ExecutionMode::Immediate);
    }

    #[test]
    fn test_uncovered_capabilities_are_skipped() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("r", SpecialistKind::ResearchSpecialist, &[], 5)
            .unwrap();
        let planner = TaskPlanner::new(registry, true);

        let plan = planner.create_plan(
            "t",
            &analysis(
                vec![Capability::DocumentAnalysis, Capability::Research],
                DelegationStrategy::Parallel,
            ),
            TaskPriority::Normal,
        );
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].specialist_id, "r");

        let empty = planner.create_plan(
            "t",
            &analysis(vec![Capability::Simulation], DelegationStrategy::Collaborative),
            TaskPriority::Normal,
        );
        assert!(empty.is_empty());
    }
}
